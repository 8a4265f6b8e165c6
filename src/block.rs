use std::fmt;

/// Block number of one data unit within a transfer.
///
/// Numbering starts at 1 (0 is the acknowledgment of a write request) and
/// wraps modulo 65536.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(u16);

impl Block {
    pub const FIRST: Block = Block(1);

    pub fn new(n: u16) -> Self {
        Block(n)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn succ(self) -> Self {
        Block(self.0.wrapping_add(1))
    }

    pub fn pred(self) -> Self {
        Block(self.0.wrapping_sub(1))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_modulo_65536() {
        let last = Block::new(u16::MAX);
        assert_eq!(last.succ().get(), 0);
        assert_eq!(last.succ().succ(), Block::FIRST);
        assert_eq!(Block::new(0).pred(), last);
    }

    #[test]
    fn sequence_has_no_gaps() {
        let mut block = Block::FIRST;
        for expected in 1..=1000u16 {
            assert_eq!(block.get(), expected);
            block = block.succ();
        }
    }
}
