// Position source module
// Platform positioning abstraction and device metadata probes

pub mod device;
pub mod feed;
pub mod source;

pub use device::{DeviceProbe, NoopProbe, StaticProbe};
pub use feed::{FeedSource, PositionFeed};
pub use source::{PermissionState, PositionReading, PositionSource, PositionWatch, TrackingOptions};
