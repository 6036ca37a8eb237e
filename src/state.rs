use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bounds every projected state type must meet.
///
/// `Default` supplies the empty state before hydration. Serde is needed to
/// write the state to a cache and read it back. The state is shared between
/// the store, its subscribers and the cache writer task, so it must be
/// `Send + Sync`.
///
/// Implemented automatically for every qualifying type.
pub trait State: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}
