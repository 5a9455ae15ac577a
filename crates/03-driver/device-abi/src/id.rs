use std::fmt;

/// Identity of one device connection, allocated by the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel returned when allocation fails.
    pub const INVALID: NodeId = NodeId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Bit-preserving conversion for the `int32` wire field.
    pub fn to_wire(self) -> i32 {
        self.0 as i32
    }

    pub fn from_wire(raw: i32) -> Self {
        NodeId(raw as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}
