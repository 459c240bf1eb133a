//! Splitting outbound messages into fixed-size wire frames.
//!
//! A logical message becomes one text frame followed by continuation
//! frames, the last one carrying FIN. Frame payloads never exceed the
//! configured size, so neither end buffers more than one frame's worth of
//! framing overhead per write.

/// Default wire frame payload size.
pub const WS_FRAME_SIZE: usize = 4096;

/// One wire frame of a split message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// First frame of the message (text opcode); later frames are continuations.
    pub first: bool,
    /// Final frame (FIN bit).
    pub last: bool,
    pub payload: &'a [u8],
}

/// Iterator over the wire frames of one message.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    data: &'a [u8],
    frame_size: usize,
    offset: usize,
    done: bool,
}

/// Split `data` into frames of at most `frame_size` bytes.
///
/// An empty message still yields one (empty, final) frame.
pub fn chunk_message(data: &[u8], frame_size: usize) -> Chunks<'_> {
    Chunks {
        data,
        frame_size: frame_size.max(1),
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let first = self.offset == 0;
        let end = (self.offset + self.frame_size).min(self.data.len());
        let payload = &self.data[self.offset..end];
        let last = end >= self.data.len();
        self.offset = end;
        self.done = last;
        Some(Chunk {
            first,
            last,
            payload,
        })
    }
}
