pub mod delivery;
pub mod diff;
pub mod dispatch;
pub mod notifier;
pub mod render;

pub use delivery::{Delivery, DeliveryError};
pub use dispatch::{CompositeError, PassError, PassOutcome};
pub use notifier::{Notifier, NotifierConfig, NotifierState, NotifyError};
pub use render::{RenderedNotification, Renderer};
