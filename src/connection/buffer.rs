//! Buffer of delivered payloads awaiting the reader

use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ReadBuffer {
    pub(crate) fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(data);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Copy as much as fits into `buf`, returning the number of bytes copied
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;

        while total < buf.len() {
            let Some(data) = self.chunks.front_mut() else {
                break;
            };
            let to_copy = std::cmp::min(data.len(), buf.len() - total);
            buf[total..total + to_copy].copy_from_slice(&data[..to_copy]);
            total += to_copy;

            if to_copy == data.len() {
                self.chunks.pop_front();
            } else {
                *data = data.slice(to_copy..);
            }
        }

        self.len -= total;
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_reads_span_chunks() {
        let mut buffer = ReadBuffer::default();
        buffer.push(Bytes::from_static(b"Hello"));
        buffer.push(Bytes::new());
        buffer.push(Bytes::from_static(b", World"));
        assert_eq!(buffer.len(), 12);

        let mut buf = [0u8; 3];
        assert_eq!(buffer.read(&mut buf), 3);
        assert_eq!(&buf, b"Hel");

        let mut buf = [0u8; 6];
        assert_eq!(buffer.read(&mut buf), 6);
        assert_eq!(&buf, b"lo, Wo");

        let mut buf = [0u8; 10];
        assert_eq!(buffer.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"rld");
        assert!(buffer.is_empty());
        assert_eq!(buffer.read(&mut buf), 0);
    }
}
