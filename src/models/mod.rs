use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rectangular search region in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Build a box, rejecting inverted or non-finite edges.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Option<Self> {
        let finite = [north, south, east, west].iter().all(|v| v.is_finite());
        if !finite || north < south || east < west {
            return None;
        }
        Some(Self {
            north,
            south,
            east,
            west,
        })
    }

    /// Overlap of two boxes, `None` when they only touch or are disjoint.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let north = self.north.min(other.north);
        let south = self.south.max(other.south);
        let east = self.east.min(other.east);
        let west = self.west.max(other.west);
        if north <= south || east <= west {
            return None;
        }
        BoundingBox::new(north, south, east, west)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N {:.6} S {:.6} E {:.6} W {:.6}",
            self.north, self.south, self.east, self.west
        )
    }
}

/// A named search area
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoArea {
    pub id: i64,
    pub name: String,
    pub abbreviation: String,
    pub bounding_box: Option<BoundingBox>,
}

/// Short, whitespace-free label for an area name: lower case, at most ten
/// characters, spaces as underscores, no trailing underscore.
pub fn abbreviate(name: &str) -> String {
    let short: String = name
        .to_lowercase()
        .chars()
        .take(10)
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    short.trim_end_matches('_').to_string()
}

/// Lifecycle of one crawl pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveyStatus {
    Pending,
    Running,
    Complete,
    Incomplete,
    Failed,
}

impl SurveyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
        }
    }

    /// Statuses a super survey resume picks up.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Incomplete)
    }

    /// Statuses that count as settled when a parent waits for its children.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for SurveyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SurveyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "incomplete" => Ok(Self::Incomplete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown survey status '{other}'")),
        }
    }
}

/// One crawl pass over a single area
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub id: i64,
    pub geo_area_id: i64,
    pub super_survey_id: Option<i64>,
    /// Survey whose overflow produced this one
    pub parent_survey_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SurveyStatus,
    /// Number of search pages already persisted; the next page to request
    pub page_cursor: u32,
    pub overflow: bool,
}

/// Fields needed to register a survey
#[derive(Debug, Clone, Copy, Default)]
pub struct NewSurvey {
    pub geo_area_id: i64,
    pub super_survey_id: Option<i64>,
    pub parent_survey_id: Option<i64>,
}

/// Group of surveys spawned from one root area
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperSurvey {
    pub id: i64,
    pub root_geo_area_name: String,
    pub created_at: DateTime<Utc>,
}

/// Identity of one persisted listing row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub room_id: i64,
    pub survey_id: i64,
}

/// Detail-page data attached during fill
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDetail {
    pub name: Option<String>,
    pub room_type: Option<String>,
    pub property_type: Option<String>,
    pub host_id: Option<i64>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub reviews: Option<i32>,
    pub overall_satisfaction: Option<f32>,
    pub accommodates: Option<i32>,
    pub bedrooms: Option<f32>,
    pub bathrooms: Option<f32>,
    pub raw: serde_json::Value,
}

/// A property listing as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub room_id: i64,
    pub survey_id: i64,
    pub geo_area_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub detail_fetched: bool,
    pub deleted: bool,
    pub last_modified: DateTime<Utc>,
    pub detail: Option<ListingDetail>,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            room_id: self.room_id,
            survey_id: self.survey_id,
        }
    }

    pub fn needs_fill(&self) -> bool {
        !self.detail_fetched && !self.deleted
    }
}

/// What an upsert did to the listing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row exists and is deleted; left untouched
    Tombstoned,
}
