use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Backing storage could not be obtained.
    #[snafu(display("allocation of {size} bytes failed"))]
    AllocationFailed { size: usize },

    /// Requested sub-view escapes the parent region.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds region size {region_size}"))]
    OutOfBounds { offset: usize, size: usize, region_size: usize },

    #[snafu(display("size mismatch: expected {expected} bytes, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },
}
