//! Geography: place-name geocoding and subdivision of overflowing areas.

pub mod geocoder;
pub mod splitter;

pub use geocoder::{Geocoder, NominatimGeocoder};
pub use splitter::{BoundingBoxSplitter, PartitionSource, Split};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Administrative level an area is subdivided along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDimension {
    Sublocality,
    Route,
}

impl SplitDimension {
    /// Coarse to fine, the order the splitter tries dimensions in
    pub const PREFERENCE: [SplitDimension; 2] = [SplitDimension::Sublocality, SplitDimension::Route];
}

impl fmt::Display for SplitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sublocality => f.write_str("sublocality"),
            Self::Route => f.write_str("route"),
        }
    }
}

/// First comma-separated component of an area name, the label under which
/// reverse-geocoded locations record the place.
pub fn place_label(area_name: &str) -> &str {
    area_name.split(',').next().unwrap_or(area_name).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_label_drops_the_enclosing_locality() {
        assert_eq!(place_label("Centro, Ouro Preto"), "Centro");
        assert_eq!(place_label("Ouro Preto"), "Ouro Preto");
    }
}
