pub mod airbnb;
pub mod traits;
pub mod types;

pub use airbnb::AirbnbScraper;
pub use traits::ListingScraper;
pub use types::{EgressIdentity, SearchPage, SearchRecord};
