//! Session-plane fragment reassembly.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::SessionError;

/// One in-flight fragmented message.
#[derive(Debug)]
pub struct PartialMessage {
    slots: Vec<Option<Bytes>>,
    filled: usize,
}

impl PartialMessage {
    fn new(fragment_count: u16) -> Result<Self, SessionError> {
        if fragment_count == 0 {
            return Err(SessionError::ReassemblyOverflow);
        }
        Ok(Self { slots: vec![None; fragment_count as usize], filled: 0 })
    }

    fn insert(&mut self, fragment_index: u16, data: Bytes) -> Result<(), SessionError> {
        let slot = self
            .slots
            .get_mut(fragment_index as usize)
            .ok_or(SessionError::ReassemblyOverflow)?;
        // retransmitted fragment: keep the first copy
        if slot.is_none() {
            *slot = Some(data);
            self.filled += 1;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn assemble(self) -> Bytes {
        let total: usize = self.slots.iter().flatten().map(|b| b.len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for slot in self.slots.into_iter().flatten() {
            out.put_slice(&slot);
        }
        out.freeze()
    }
}

/// Pending partial messages keyed by sequence number. Guarded by the
/// session's reassembly mutex.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    partials: HashMap<u32, PartialMessage>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place one fragment. Returns the assembled message once every
    /// fragment has arrived; the entry is removed before it is returned.
    /// A fragment outside the declared bounds drops the whole partial.
    pub fn insert_fragment(
        &mut self,
        sequence_number: u32,
        fragment_count: u16,
        fragment_index: u16,
        data: Bytes,
    ) -> Result<Option<Bytes>, SessionError> {
        if fragment_count == 0 {
            return Err(SessionError::ReassemblyOverflow);
        }
        if fragment_count == 1 {
            if fragment_index != 0 {
                return Err(SessionError::ReassemblyOverflow);
            }
            return Ok(Some(data));
        }

        let partial = match self.partials.entry(sequence_number) {
            std::collections::hash_map::Entry::Occupied(e) => {
                if e.get().slots.len() != fragment_count as usize {
                    e.remove();
                    return Err(SessionError::ReassemblyOverflow);
                }
                e.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(PartialMessage::new(fragment_count)?)
            }
        };

        if let Err(e) = partial.insert(fragment_index, data) {
            self.partials.remove(&sequence_number);
            return Err(e);
        }

        if partial.is_complete() {
            let complete = self
                .partials
                .remove(&sequence_number)
                .expect("entry present, checked above");
            return Ok(Some(complete.assemble()));
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment_completes_immediately() {
        let mut table = ReassemblyTable::new();
        let result = table.insert_fragment(1, 1, 0, Bytes::from_static(b"whole")).unwrap();
        assert_eq!(result.unwrap().as_ref(), b"whole");
        assert!(table.is_empty());
    }

    #[test]
    fn test_two_fragments_in_order() {
        let mut table = ReassemblyTable::new();
        assert!(table
            .insert_fragment(7, 2, 0, Bytes::from_static(b"hello "))
            .unwrap()
            .is_none());
        assert_eq!(table.len(), 1);
        let out = table
            .insert_fragment(7, 2, 1, Bytes::from_static(b"world"))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_ref(), b"hello world");
        assert!(table.is_empty());
    }

    #[test]
    fn test_fragments_out_of_order() {
        let mut table = ReassemblyTable::new();
        assert!(table
            .insert_fragment(3, 3, 2, Bytes::from_static(b"c"))
            .unwrap()
            .is_none());
        assert!(table
            .insert_fragment(3, 3, 0, Bytes::from_static(b"a"))
            .unwrap()
            .is_none());
        let out = table
            .insert_fragment(3, 3, 1, Bytes::from_static(b"b"))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_ref(), b"abc");
    }

    #[test]
    fn test_duplicate_fragment_keeps_first() {
        let mut table = ReassemblyTable::new();
        table.insert_fragment(5, 2, 0, Bytes::from_static(b"first")).unwrap();
        table.insert_fragment(5, 2, 0, Bytes::from_static(b"second")).unwrap();
        let out = table
            .insert_fragment(5, 2, 1, Bytes::from_static(b"!"))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_ref(), b"first!");
    }

    #[test]
    fn test_index_out_of_bounds_drops_partial() {
        let mut table = ReassemblyTable::new();
        table.insert_fragment(9, 2, 0, Bytes::from_static(b"x")).unwrap();
        let result = table.insert_fragment(9, 2, 5, Bytes::from_static(b"y"));
        assert!(matches!(result, Err(SessionError::ReassemblyOverflow)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_count_mismatch_drops_partial() {
        let mut table = ReassemblyTable::new();
        table.insert_fragment(9, 2, 0, Bytes::from_static(b"x")).unwrap();
        let result = table.insert_fragment(9, 3, 1, Bytes::from_static(b"y"));
        assert!(matches!(result, Err(SessionError::ReassemblyOverflow)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_independent_sequence_numbers() {
        let mut table = ReassemblyTable::new();
        table.insert_fragment(1, 2, 0, Bytes::from_static(b"a")).unwrap();
        table.insert_fragment(2, 2, 0, Bytes::from_static(b"b")).unwrap();
        assert_eq!(table.len(), 2);
        table.clear();
        assert!(table.is_empty());
    }
}
