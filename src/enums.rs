/// How structure masks are brought onto the dose grid's geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OversamplingPolicy {
    /// One oversampled geometry derived from the dose grid, shared by all
    /// structures in a run. The dose grid is resampled onto it once.
    Fixed(f64),
    /// A per-structure factor computed from the cube root of the voxel
    /// volume ratio between the dose grid and the structure's native mask,
    /// rounded to two decimals.
    Automatic,
}

impl Default for OversamplingPolicy {
    fn default() -> Self {
        OversamplingPolicy::Fixed(2.0)
    }
}

/// Field delimiter for the serialized DVH and metrics tables.
///
/// Tab-delimited output replaces the decimal point with a comma in sample
/// values, so files open cleanly in spreadsheet locales that expect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delimiter {
    #[default]
    Comma,
    Tab,
}

impl Delimiter {
    pub fn as_char(&self) -> char {
        match self {
            Delimiter::Comma => ',',
            Delimiter::Tab => '\t',
        }
    }

    /// Whether sample values are emitted with a decimal comma.
    pub fn uses_decimal_comma(&self) -> bool {
        matches!(self, Delimiter::Tab)
    }
}
