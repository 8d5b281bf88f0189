use serde::{Deserialize, Serialize};

/// How aggressively text is corrected while streaming
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionIntensity {
    /// Whitespace cleanup only
    Light,
    /// Whitespace plus structural repairs (fences, headings, tags, math, brackets)
    #[default]
    Moderate,
    /// Moderate plus a partial repair pass on every chunk during preprocessing
    Aggressive,
}

impl CorrectionIntensity {
    pub fn structural(self) -> bool {
        !matches!(self, CorrectionIntensity::Light)
    }
}

/// Toggles recognized by the preprocessing and repair engines
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatCorrectionConfig {
    pub enable_json_correction: bool,
    pub enable_xml_html_correction: bool,
    pub enable_math_correction: bool,
    pub enable_programming_syntax_correction: bool,
    pub correction_intensity: CorrectionIntensity,
    pub enable_caching: bool,
    /// Entries per cache before the oldest half is evicted
    pub max_cache_size: usize,
    /// Per-operation time budget; also bounds the chunk size preprocessing will touch
    pub max_processing_time_ms: u64,
    /// Run the repair engine on every content update rather than only at stream end
    pub enable_progressive_correction: bool,
}

impl Default for FormatCorrectionConfig {
    fn default() -> Self {
        Self {
            enable_json_correction: true,
            enable_xml_html_correction: true,
            enable_math_correction: true,
            enable_programming_syntax_correction: true,
            correction_intensity: CorrectionIntensity::Moderate,
            enable_caching: true,
            max_cache_size: 256,
            max_processing_time_ms: 50,
            enable_progressive_correction: true,
        }
    }
}
