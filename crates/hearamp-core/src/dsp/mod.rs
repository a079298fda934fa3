//! Signal processing stages
//!
//! Everything here runs on the audio thread: fixed-size state, no
//! allocation after construction, no locks, no logging.
//!
//! ```text
//!  mic ─► feedback.cancel ─► gate ─► split ─► dynamics ─► band gains ─►
//!        recombine ─► howl notch ─► master ─► limiter ─► earpiece
//! ```

pub mod band_splitter;
pub mod dynamics;
pub mod feedback;
pub mod limiter;

pub use band_splitter::{BandSplitter, SplitTopology};
pub use dynamics::{static_gain_db, CurveLimits, DynamicsProcessor, MasterGain, NoiseGate};
pub use feedback::{FeedbackConfig, FeedbackReport, FeedbackSuppressor};
pub use limiter::{Limiter, LimiterActivity, LimiterConfig};
