pub mod command;
pub mod config;
pub mod constants;
pub mod delay;
pub mod dtmf;
pub mod id;
pub mod level;
pub mod mode;
pub mod ptt;
pub mod repeater;
pub mod tone;
pub mod vox;

pub use config::{RepeaterConfig, RepeaterMode};
pub use dtmf::DtmfKey;
pub use repeater::{
    AnnouncementKind, AnnouncementReady, AnnouncementRequest, Control, CoreHandle, KeyLine,
    RepeaterCore, RepeaterEvent, RepeaterState, RepeaterStatus,
};
