//! # Classify
//!
//! Eightbyte classification of by-value aggregates for the x86-64 System V convention.
//!
//! The rules are deliberately conservative: an aggregate with a non-trivial destructor or copy constructor always
//! travels behind a hidden pointer, even when a literal reading of the ABI would only require it for non-trivially
//! copyable types. Native callees built against this library rely on that.

use super::{PassFlags, PassInfo};

/// Register class of one eightbyte window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordClass {
    /// General-purpose register
    Integer,
    /// Vector register
    Sse,
}

/// Register classes of an aggregate that fits in registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eightbytes {
    /// Classes of the windows, only the first `count` are meaningful
    words: [WordClass; 2],
    /// Number of windows (1 or 2)
    count: usize,
    /// Size of the aggregate
    size: usize,
}

impl Eightbytes {
    /// One general-purpose window of `size` bytes
    pub(crate) fn single_integer(size: usize) -> Self {
        Self {
            words: [WordClass::Integer; 2],
            count: 1,
            size,
        }
    }

    /// Classes of every window in order
    pub fn words(&self) -> &[WordClass] {
        &self.words[..self.count]
    }

    /// Number of general-purpose registers needed
    pub fn integer_count(&self) -> usize {
        self.words().iter().filter(|w| **w == WordClass::Integer).count()
    }

    /// Number of vector registers needed
    pub fn sse_count(&self) -> usize {
        self.count - self.integer_count()
    }

    /// Iterates `(byte offset, byte length, class)` of every window
    pub fn windows(&self) -> impl Iterator<Item = (usize, usize, WordClass)> + '_ {
        let size = self.size;
        self.words().iter().enumerate().map(move |(i, class)| {
            let offset = i * 8;
            (offset, (size - offset).min(8), *class)
        })
    }
}

/// How an aggregate travels across a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// One or two eightbytes in registers
    Registers(Eightbytes),
    /// Copied onto the stack (or returned through a hidden pointer)
    Memory,
    /// Passed (or returned) through a hidden pointer to a caller-owned copy
    Pointer,
}

impl Classification {
    /// Whether the value avoids registers entirely
    pub fn is_in_memory(&self) -> bool {
        !matches!(self, Self::Registers(_))
    }

    /// Register windows, if the value fits in registers
    pub fn eightbytes(&self) -> Option<&Eightbytes> {
        match self {
            Self::Registers(words) => Some(words),
            _ => None,
        }
    }
}

/// Merges the class of a field into the class of its window
///
/// Integer wins over SSE, and anything wins over an empty window.
fn merge(current: Option<WordClass>, field: WordClass) -> Option<WordClass> {
    match (current, field) {
        (None, class) => Some(class),
        (Some(WordClass::Integer), _) | (_, WordClass::Integer) => Some(WordClass::Integer),
        (Some(WordClass::Sse), WordClass::Sse) => Some(WordClass::Sse),
    }
}

/// Classifies a by-value aggregate without regard for register pressure
pub fn classify_sysv(info: &PassInfo) -> Classification {
    let flags = info.flags();
    if info.size() > 16 || flags.contains(PassFlags::UNALIGNED) {
        return Classification::Memory;
    }
    if flags.intersects(PassFlags::DTOR | PassFlags::COPY_CTOR) {
        return Classification::Pointer;
    }

    let count = if info.size() <= 8 { 1 } else { 2 };
    let mut classes = [None; 2];
    for (offset, field) in info.field_layout() {
        let class = if field.is_float() {
            WordClass::Sse
        } else {
            WordClass::Integer
        };
        let window = (offset / 8).min(count - 1);
        classes[window] = merge(classes[window], class);
    }

    Classification::Registers(Eightbytes {
        words: classes.map(|class| class.unwrap_or(WordClass::Integer)),
        count,
        size: info.size(),
    })
}

/// Classifies a by-value aggregate, degrading to [`Classification::Memory`] when its windows would not fit in the
/// remaining argument registers
pub fn classify_with_budget(info: &PassInfo, integer_left: usize, sse_left: usize) -> Classification {
    match classify_sysv(info) {
        Classification::Registers(words)
            if words.integer_count() > integer_left || words.sse_count() > sse_left =>
        {
            Classification::Memory
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::signature::FieldKind;

    /// Generates field lists whose natural layout fits in 16 bytes
    fn small_aggregate() -> impl Strategy<Value = PassInfo> {
        prop::collection::vec(
            prop::sample::select(vec![
                FieldKind::Bool,
                FieldKind::Int8,
                FieldKind::Int16,
                FieldKind::Int32,
                FieldKind::Int64,
                FieldKind::Pointer,
                FieldKind::Float,
                FieldKind::Double,
            ]),
            1..6,
        )
        .prop_filter_map("aggregate larger than 16 bytes", |fields| {
            let probe = PassInfo::aggregate(16, fields.clone());
            let end = probe
                .field_layout()
                .last()
                .map(|(offset, field)| offset + field.size())?;
            (end <= 16).then(|| PassInfo::aggregate(end, fields))
        })
    }

    proptest! {
        #[test]
        /// One window up to 8 bytes, two windows up to 16 bytes
        fn prop_window_totals(info in small_aggregate()) {
            let class = classify_sysv(&info);
            let words = class.eightbytes().expect("plain small aggregates use registers");
            let expected = if info.size() <= 8 { 1 } else { 2 };
            prop_assert_eq!(words.words().len(), expected);
            prop_assert_eq!(words.windows().map(|(_, len, _)| len).sum::<usize>(), info.size());
        }

        #[test]
        /// Memory (or hidden pointer) exactly when the size, alignment or lifecycle demands it
        fn prop_memory_iff(
            info in small_aggregate(),
            extra in prop::sample::select(vec![
                PassFlags::empty(),
                PassFlags::UNALIGNED,
                PassFlags::DTOR,
                PassFlags::COPY_CTOR,
                PassFlags::CTOR,
                PassFlags::ASSIGN,
            ]),
        ) {
            let info = info.with_flags(extra);
            let expected = extra.intersects(PassFlags::UNALIGNED | PassFlags::DTOR | PassFlags::COPY_CTOR);
            prop_assert_eq!(classify_sysv(&info).is_in_memory(), expected);
        }
    }

    #[test]
    /// Aggregates over 16 bytes always go through memory
    fn test_large_is_memory() {
        let info = PassInfo::aggregate(24, []).with_flags(PassFlags::UNALIGNED);
        assert_eq!(classify_sysv(&info), Classification::Memory);
        let info = PassInfo::aggregate(17, []);
        assert_eq!(classify_sysv(&info), Classification::Memory);
    }

    #[test]
    /// Three 32-bit integers span two integer windows of 8 and 4 bytes
    fn test_three_ints() {
        let info = PassInfo::aggregate(12, [FieldKind::Int32; 3]);
        let class = classify_sysv(&info);
        let words = class.eightbytes().unwrap();
        assert_eq!(words.words(), [WordClass::Integer, WordClass::Integer]);
        assert_eq!(
            words.windows().collect::<Vec<_>>(),
            [(0, 8, WordClass::Integer), (8, 4, WordClass::Integer)]
        );
    }

    #[test]
    /// Integer beats float inside a window, float windows stay in vector registers
    fn test_mixed_windows() {
        let info = PassInfo::aggregate(16, [FieldKind::Float, FieldKind::Int32, FieldKind::Double]);
        let words = *classify_sysv(&info).eightbytes().unwrap();
        assert_eq!(words.words(), [WordClass::Integer, WordClass::Sse]);

        let info = PassInfo::aggregate(8, [FieldKind::Float, FieldKind::Float]);
        let words = *classify_sysv(&info).eightbytes().unwrap();
        assert_eq!(words.words(), [WordClass::Sse]);
    }

    #[test]
    /// Destructors force a hidden pointer
    fn test_dtor_is_pointer() {
        let info = PassInfo::aggregate(8, [FieldKind::Int64]).with_flags(PassFlags::DTOR);
        assert_eq!(classify_sysv(&info), Classification::Pointer);
    }

    #[test]
    /// Running out of registers degrades the whole aggregate to memory
    fn test_budget() {
        let info = PassInfo::aggregate(16, [FieldKind::Int64, FieldKind::Double]);
        assert!(!classify_with_budget(&info, 1, 1).is_in_memory());
        assert_eq!(classify_with_budget(&info, 0, 8), Classification::Memory);
        assert_eq!(classify_with_budget(&info, 6, 0), Classification::Memory);
    }
}
