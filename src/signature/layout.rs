//! # Layout
//!
//! Binds the parameters of a [`Signature`] to byte offsets in a flat argument buffer. Both the forward and the hook
//! direction use the same table, so a buffer packed for one can be handed to the other unchanged.

use super::{PassInfo, Signature};

/// Trailing bytes every argument buffer carries past its last parameter.
///
/// Aggregate windows with an odd size are loaded with a full 8-byte read.
pub const BUFFER_SLACK: usize = 8;

/// A parameter bound to its position in the argument buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassEncode {
    /// Shape of the parameter
    pub info: PassInfo,
    /// Byte offset of the parameter's value
    pub offset: usize,
}

impl PassEncode {
    /// Range of bytes the parameter occupies
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.info.size()
    }
}

/// Offset table of a signature for one pointer width
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamLayout {
    /// Pointer width of the target
    word_size: usize,
    /// Whether offset 0 holds the receiver
    receiver: bool,
    /// Encoded parameters in declaration order
    params: Vec<PassEncode>,
    /// End of the last parameter
    size: usize,
}

impl ParamLayout {
    /// Lays out `signature` for a target with `word_size`-byte pointers
    ///
    /// The receiver, when the convention has one, occupies the first word. Every parameter follows the previous one
    /// without padding; a by-reference parameter stores the referenced value itself.
    pub fn new(signature: &Signature, word_size: usize) -> Self {
        let receiver = signature.convention().has_receiver();
        let mut cursor = if receiver { word_size } else { 0 };

        let params = signature
            .params()
            .iter()
            .map(|info| {
                let encoded = PassEncode {
                    info: info.clone(),
                    offset: cursor,
                };
                cursor += info.size();
                encoded
            })
            .collect();

        Self {
            word_size,
            receiver,
            params,
            size: cursor,
        }
    }

    /// Pointer width the layout was built for
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    /// Whether offset 0 holds the receiver
    pub fn has_receiver(&self) -> bool {
        self.receiver
    }

    /// Encoded parameters in declaration order
    pub fn params(&self) -> &[PassEncode] {
        &self.params
    }

    /// Encoded parameter at `index`
    pub fn get(&self, index: usize) -> Option<&PassEncode> {
        self.params.get(index)
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the signature declares no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Logical size of the buffer: receiver plus every parameter
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually reserved for a buffer: the logical size rounded to 8, plus [`BUFFER_SLACK`]
    pub fn storage_size(&self) -> usize {
        ((self.size + 7) & !7) + BUFFER_SLACK
    }
}
