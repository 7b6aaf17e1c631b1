pub mod checksum;
pub mod file_scanner;
pub mod probe;
pub mod roots;
pub mod sidecar;

pub use checksum::{partial_checksum, ChecksumCache, CHECKSUM_SAMPLE_BYTES};
pub use file_scanner::{DiscoveredEntry, FileScanner, ScanConfig, ScanResult};
pub use probe::{DurationProbe, FfprobeDuration, NoProbe};
pub use roots::MediaRoots;
