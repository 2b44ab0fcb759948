// smartmarks services
// Services are the platform clients (auth, store, realtime), PKCE material and settings.

pub mod auth_client;
pub mod pkce;
pub mod realtime;
pub mod settings_engine;
pub mod store_client;
