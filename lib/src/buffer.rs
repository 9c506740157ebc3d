//! Fixed capacity byte buffer, one per client
//!
//! Bytes are appended at the end and consumed from the front. The buffer
//! never grows: a client whose header does not fit is closed.

pub struct Buffer {
    memory: Box<[u8]>,
    position: usize,
    end: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            memory: vec![0; capacity].into_boxed_slice(),
            position: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position == self.end
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.memory[self.position..self.end]
    }

    /// all the free space, the data is moved to the front first
    pub fn space(&mut self) -> &mut [u8] {
        self.shift();
        &mut self.memory[self.end..]
    }

    /// marks `count` bytes written into `space()` as data
    pub fn fill(&mut self, count: usize) -> usize {
        let count = count.min(self.capacity() - self.end);
        self.end += count;
        count
    }

    pub fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.len());
        self.position += count;
        if self.position == self.end {
            self.position = 0;
            self.end = 0;
        }
        count
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.end = 0;
    }

    /// copies as much of `data` as fits, returns the copied length
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let space = self.space();
        let count = data.len().min(space.len());
        space[..count].copy_from_slice(&data[..count]);
        self.fill(count)
    }

    /// Replaces the first `head_len` bytes of data with `head`, keeping what
    /// follows. Fails without modification if the result would not fit.
    pub fn replace_head(&mut self, head_len: usize, head: &[u8]) -> bool {
        if head_len > self.len() || self.len() - head_len + head.len() > self.capacity() {
            return false;
        }

        self.shift();
        let tail_len = self.end - head_len;
        self.memory.copy_within(head_len..self.end, head.len());
        self.memory[..head.len()].copy_from_slice(head);
        self.end = head.len() + tail_len;
        true
    }

    fn shift(&mut self) {
        if self.position > 0 {
            let len = self.len();
            self.memory.copy_within(self.position..self.end, 0);
            self.position = 0;
            self.end = len;
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
