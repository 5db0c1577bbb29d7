//! Per-node capability flags
//!
//! One [Node] exists for every address on the bus. Flags are only ever
//! changed by evidence heard from that node, and are read before every
//! transmission to pick the CRC variant.

/// The capability flags of a single address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Node {
    crc16: bool,
    interrupter: bool,
}

impl Node {
    /// A node nothing has been heard from yet
    pub const fn const_new() -> Self {
        Self {
            crc16: false,
            interrupter: false,
        }
    }

    /// Should frames to this node use CRC16?
    #[inline]
    pub fn crc16(&self) -> bool {
        self.crc16
    }

    /// Has this node ever sent an interrupt?
    #[inline]
    pub fn is_interrupter(&self) -> bool {
        self.interrupter
    }

    /// Record an interrupt frame heard from this node
    pub fn heard_interrupt(&mut self, crc16: bool) {
        self.interrupter = true;
        self.crc16 = crc16;
    }
}

/// The node attribute table, indexed by address
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: [Node; 256],
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    /// A table with every flag cleared
    pub const fn new() -> Self {
        Self {
            nodes: [Node::const_new(); 256],
        }
    }

    /// The flags of `addr`
    #[inline]
    pub fn get(&self, addr: u8) -> &Node {
        &self.nodes[usize::from(addr)]
    }

    /// The flags of `addr`, mutably
    #[inline]
    pub fn get_mut(&mut self, addr: u8) -> &mut Node {
        &mut self.nodes[usize::from(addr)]
    }

    /// Should frames to `addr` use CRC16?
    ///
    /// Broadcasts always go out as CRC8, so that every node can hear them.
    #[inline]
    pub fn crc16_for(&self, addr: u8) -> bool {
        addr != crate::BROADCAST_ADDR && self.get(addr).crc16()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sticky_crc() {
        let mut table = NodeTable::new();
        assert!(!table.crc16_for(0x05));
        table.get_mut(0x05).heard_interrupt(true);
        assert!(table.crc16_for(0x05));
        assert!(!table.crc16_for(0x06));
        // Only fresh evidence from the node clears it
        table.get_mut(0x06).heard_interrupt(false);
        assert!(table.crc16_for(0x05));
        table.get_mut(0x05).heard_interrupt(false);
        assert!(!table.crc16_for(0x05));
        assert!(table.get(0x05).is_interrupter());
        assert!(table.get(0x06).is_interrupter());
        assert!(!table.get(0x07).is_interrupter());
    }

    #[test]
    fn broadcast_is_crc8() {
        let mut table = NodeTable::new();
        table.get_mut(0xFF).heard_interrupt(true);
        assert!(!table.crc16_for(0xFF));
    }
}
