//! Flight sequencer: composite operations over the link, engine, and
//! controllers.

pub mod intent;
pub mod result;
pub mod sequencer;

pub use intent::NavigationIntent;
pub use result::TranslateReport;
pub use sequencer::FlightSequencer;
