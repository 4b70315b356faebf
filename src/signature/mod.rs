//! # Signature
//!
//! Runtime descriptions of a native call shape. A [`Signature`] is the only input the compilers need: the calling
//! convention, the shape of every parameter and the shape of the return value.
//!
//! Descriptors are plain data and are copied into every handle built from them, so a caller can drop or reuse its own
//! copy right after compiling.

use bitflags::bitflags;

pub mod classify;
pub mod layout;

pub use classify::{classify_sysv, classify_with_budget, Classification, Eightbytes, WordClass};
pub use layout::{ParamLayout, PassEncode};

/// Register/stack protocol of a described function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConvention {
    /// Member-function convention: an implicit receiver travels ahead of the declared parameters
    ThisCall,
    /// Plain C convention without a receiver
    Cdecl,
}

impl CallConvention {
    /// Whether calls using this convention carry an implicit receiver
    pub fn has_receiver(self) -> bool {
        matches!(self, Self::ThisCall)
    }
}

/// Broad category of a passed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Integers and pointers
    Integer,
    /// IEEE single or double precision
    Float,
    /// Struct-like values
    Aggregate,
}

bitflags! {
    /// Transport and lifecycle flags of a passed value
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PassFlags: u32 {
        /// Passed by value
        const BYVAL = 1 << 0;
        /// Passed by reference; the callee receives the address of the value
        const BYREF = 1 << 1;
        /// Aggregate has a non-trivial destructor
        const DTOR = 1 << 2;
        /// Aggregate has a non-trivial constructor
        const CTOR = 1 << 3;
        /// Aggregate has a non-trivial assignment operator
        const ASSIGN = 1 << 4;
        /// Aggregate has a non-trivial copy constructor
        const COPY_CTOR = 1 << 5;
        /// Aggregate contains unaligned fields
        const UNALIGNED = 1 << 6;
        /// Sub-word integer is sign extended instead of zero extended
        const SIGNED = 1 << 7;
    }
}

impl PassFlags {
    /// Every flag describing a non-trivial aggregate lifecycle
    pub const LIFECYCLE: Self = Self::DTOR
        .union(Self::CTOR)
        .union(Self::ASSIGN)
        .union(Self::COPY_CTOR);
}

bitflags! {
    /// Flags describing a whole function
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u32 {
        /// The target takes a variable argument list after the described parameters
        const VARIADIC = 1 << 0;
    }
}

/// Primitive field of an aggregate, used to classify small aggregates on x86-64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `bool`
    Bool,
    /// 8-bit integer
    Int8,
    /// 16-bit integer
    Int16,
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
    /// 64-bit pointer
    Pointer,
    /// Single precision float
    Float,
    /// Double precision float
    Double,
}

impl FieldKind {
    /// Size (and natural alignment) of the field in bytes
    pub fn size(self) -> usize {
        match self {
            Self::Bool | Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float => 4,
            Self::Int64 | Self::Pointer | Self::Double => 8,
        }
    }

    /// Whether the field lives in vector registers
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

/// Transport description of a single value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassInfo {
    /// Category of the value
    kind: PassKind,
    /// Size of the value in bytes
    size: usize,
    /// Transport and lifecycle flags
    flags: PassFlags,
    /// Field kinds in declaration order, only for aggregates up to 16 bytes
    fields: Vec<FieldKind>,
}

impl PassInfo {
    /// Describes a by-value integer (or pointer) of `size` bytes
    pub fn integer(size: usize) -> Self {
        Self {
            kind: PassKind::Integer,
            size,
            flags: PassFlags::BYVAL,
            fields: Vec::new(),
        }
    }

    /// Describes a by-value signed integer of `size` bytes
    pub fn signed(size: usize) -> Self {
        Self::integer(size).with_flags(PassFlags::SIGNED)
    }

    /// Describes a by-value pointer of the host's width
    pub fn pointer() -> Self {
        Self::integer(std::mem::size_of::<usize>())
    }

    /// Describes a by-value float of `size` bytes
    pub fn float(size: usize) -> Self {
        Self {
            kind: PassKind::Float,
            size,
            flags: PassFlags::BYVAL,
            fields: Vec::new(),
        }
    }

    /// Describes a by-value aggregate of `size` bytes made of `fields`
    pub fn aggregate(size: usize, fields: impl Into<Vec<FieldKind>>) -> Self {
        Self {
            kind: PassKind::Aggregate,
            size,
            flags: PassFlags::BYVAL,
            fields: fields.into(),
        }
    }

    /// Switches the value to pass-by-reference
    pub fn by_ref(mut self) -> Self {
        self.flags.remove(PassFlags::BYVAL);
        self.flags.insert(PassFlags::BYREF);
        self
    }

    /// Adds extra flags
    pub fn with_flags(mut self, flags: PassFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Category of the value
    pub fn kind(&self) -> PassKind {
        self.kind
    }

    /// Size of the value in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Transport and lifecycle flags
    pub fn flags(&self) -> PassFlags {
        self.flags
    }

    /// Declared fields of a small aggregate
    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    /// Whether the callee receives the address of the value
    pub fn is_by_ref(&self) -> bool {
        self.flags.contains(PassFlags::BYREF)
    }

    /// Whether sub-word values are sign extended
    pub fn is_signed(&self) -> bool {
        self.flags.contains(PassFlags::SIGNED)
    }

    /// Whether this is an aggregate passed by value
    pub fn is_aggregate_by_val(&self) -> bool {
        self.kind == PassKind::Aggregate && !self.is_by_ref()
    }

    /// Whether the aggregate has any non-trivial lifecycle hook
    pub fn has_lifecycle(&self) -> bool {
        self.flags.intersects(PassFlags::LIFECYCLE)
    }

    /// Iterates `(offset, field)` pairs with every field at its natural alignment
    pub fn field_layout(&self) -> impl Iterator<Item = (usize, FieldKind)> + '_ {
        let mut cursor = 0;
        self.fields.iter().map(move |&field| {
            let align = field.size();
            let offset = (cursor + align - 1) & !(align - 1);
            cursor = offset + field.size();
            (offset, field)
        })
    }

    /// Checks the descriptor contract. Violations are programming errors and panic.
    pub(crate) fn validate(&self) {
        assert!(self.size > 0, "passed values must have a non-zero size");
        assert!(
            self.flags.contains(PassFlags::BYVAL) != self.flags.contains(PassFlags::BYREF),
            "a value is passed either by value or by reference"
        );
        assert!(
            self.fields.is_empty() || (self.kind == PassKind::Aggregate && self.size <= 16),
            "field lists only describe aggregates of at most 16 bytes"
        );

        if self.is_by_ref() {
            return;
        }

        match self.kind {
            PassKind::Integer => assert!(
                matches!(self.size, 1 | 2 | 4 | 8),
                "integer values are 1, 2, 4 or 8 bytes wide, got {}",
                self.size
            ),
            PassKind::Float => assert!(
                matches!(self.size, 4 | 8),
                "float values are 4 or 8 bytes wide, got {}",
                self.size
            ),
            PassKind::Aggregate => {
                let needs_fields = self.size <= 16
                    && !self.flags.intersects(
                        PassFlags::DTOR | PassFlags::COPY_CTOR | PassFlags::UNALIGNED,
                    );
                if needs_fields {
                    assert!(
                        !self.fields.is_empty(),
                        "aggregates of {} bytes must describe their fields",
                        self.size
                    );
                }
                let end = self
                    .field_layout()
                    .last()
                    .map(|(offset, field)| offset + field.size())
                    .unwrap_or(0);
                assert!(
                    end <= self.size,
                    "fields span {end} bytes but the aggregate is only {} bytes",
                    self.size
                );
            }
        }
    }
}

/// Full shape of one callable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Calling convention
    convention: CallConvention,
    /// Declared parameters, receiver excluded
    params: Vec<PassInfo>,
    /// Return shape, `None` for `void`
    ret: Option<PassInfo>,
    /// Function-wide flags
    flags: FunctionFlags,
}

impl Signature {
    /// Creates a signature, asserting that every shape is well formed
    pub fn new(
        convention: CallConvention,
        ret: Option<PassInfo>,
        params: Vec<PassInfo>,
        flags: FunctionFlags,
    ) -> Self {
        params.iter().for_each(PassInfo::validate);
        if let Some(ret) = &ret {
            ret.validate();
        }

        Self {
            convention,
            params,
            ret,
            flags,
        }
    }

    /// Calling convention
    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    /// Declared parameters
    pub fn params(&self) -> &[PassInfo] {
        &self.params
    }

    /// Return shape
    pub fn ret(&self) -> Option<&PassInfo> {
        self.ret.as_ref()
    }

    /// Function-wide flags
    pub fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Whether the target takes a variable argument list
    pub fn is_variadic(&self) -> bool {
        self.flags.contains(FunctionFlags::VARIADIC)
    }

    /// Bytes the return buffer must hold on a target with `word_size`-byte pointers
    ///
    /// A by-reference return is a pointer.
    pub fn ret_size(&self, word_size: usize) -> usize {
        match &self.ret {
            None => 0,
            Some(ret) if ret.is_by_ref() => word_size,
            Some(ret) => ret.size(),
        }
    }
}
