//! OAI-PMH harvesting: protocol vocabulary, streaming record extraction
//! and the per-repository harvest engine.

pub mod engine;
pub mod error;
pub mod extract;
pub mod notification;
pub mod params;
pub mod protocol;
pub mod record;
pub mod response;
pub mod serialize;
pub mod testing;

pub use engine::{CollectingHandler, HarvestState, Harvester, HarvesterBuilder, ResponseHandler};
pub use error::{ExtractError, HarvestError};
pub use extract::{RecordExtractor, RecordHooks, finalize_record};
pub use notification::{HarvestNotification, HarvestObserver, HarvestStats, NotificationType};
pub use params::{Granularity, HarvestParameters};
pub use protocol::{DEFAULT_METADATA_PREFIX, Parameter, ProtocolError, Verb};
pub use record::{CHECKSUM_LEN, HarvestedRecord};
pub use response::{PageSummary, read_page};
pub use serialize::{Binding, PayloadEvent, serialize_payload};
