pub mod clone;
pub mod disk_image;
pub mod overlay;
pub mod vm;

pub use clone::{CloneExecutor, ClonePolicy, TaskWait};
pub use disk_image::{DiskImageTool, QemuImg, SimulatedDiskImages};
pub use overlay::{
    start_in_batches, CloudInit, DiskLayout, IpConfig, OverlayDiskBuilder, OverlayRequest,
};
pub use vm::{CloneOutcome, CloneRequest, FleetVm, VmRole};
