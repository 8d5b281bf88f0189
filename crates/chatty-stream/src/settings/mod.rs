pub mod format_correction;
pub mod stream_settings;

pub use format_correction::{CorrectionIntensity, FormatCorrectionConfig};
pub use stream_settings::StreamSettings;
