//! embedded - the bridge as a virtual sink/source pair inside a host audio
//! server, loaded with `key=value` module arguments.

mod device_pair;
mod host;
mod modargs;

pub use device_pair::DevicePair;
pub use host::{ChannelMap, DeviceKind, HostServer, SampleSpec, VirtualDevice};
pub use modargs::ModuleArgs;
