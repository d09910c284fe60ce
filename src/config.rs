pub mod settings;

pub use settings::{
    generate_default_config, CloneSettings, FleetSettings, HypervisorSettings, OverlaySettings,
    PlacementSettings, ProgressSettings, ServerSettings, Settings,
};
