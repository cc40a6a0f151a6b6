//! Launch geometry: how many threads per block and blocks per grid a
//! kernel launch covers. Both default to a single unit along every axis.

/// Threads per block along each axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional geometry: `(x, 1, 1)`.
    pub const fn x(x: u32) -> Self {
        Self::new(x, 1, 1)
    }

    pub const fn xy(x: u32, y: u32) -> Self {
        Self::new(x, y, 1)
    }

    /// Total threads per block. Saturates at `u64::MAX`.
    pub const fn count(&self) -> u64 {
        (self.x as u64).saturating_mul(self.y as u64).saturating_mul(self.z as u64)
    }
}

impl Default for ThreadDim {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Blocks per grid along each axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional geometry: `(x, 1, 1)`.
    pub const fn x(x: u32) -> Self {
        Self::new(x, 1, 1)
    }

    pub const fn xy(x: u32, y: u32) -> Self {
        Self::new(x, y, 1)
    }

    /// Total blocks per grid. Saturates at `u64::MAX`.
    pub const fn count(&self) -> u64 {
        (self.x as u64).saturating_mul(self.y as u64).saturating_mul(self.z as u64)
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}
