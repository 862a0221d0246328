pub mod b3;
pub mod cvm;
pub mod manual;
pub mod util;

pub use b3::B3Fetcher;
pub use cvm::CvmFetcher;
pub use manual::ManualFallbackFetcher;
