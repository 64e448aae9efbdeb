pub mod engine;
pub mod geomath;
pub mod journey;
pub mod reach;
pub mod state;
pub mod time;
pub mod timetable;

use time::DeltaTime;

/// Maximum number of transfers a single search will consider. Rounds are numbered `0..=MAX_TRANSFERS`.
pub const MAX_TRANSFERS: usize = 7;

/// Maximum number of via locations a query may require.
pub const MAX_VIAS: usize = 2;

/// Earliest arrival per count of satisfied vias. Slot `v` holds the best time having visited
/// exactly the first `v` vias of the query in order.
pub type ViaLabels = [DeltaTime; MAX_VIAS + 1];

pub const INVALID_LABELS: ViaLabels = [DeltaTime::INVALID; MAX_VIAS + 1];
