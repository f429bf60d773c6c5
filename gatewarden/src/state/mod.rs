// Per-identity shared state: the TTL window store and behavior profiles.

pub mod profile;
pub mod window;

pub use profile::BehaviorProfile;
pub use window::WindowStore;
