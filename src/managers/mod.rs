// smartmarks state managers
// Managers own the session, talk to the bookmark store, follow the change feed and reconcile the view.

pub mod bookmark_manager;
pub mod feed_subscriber;
pub mod reconciler;
pub mod session_manager;
pub mod view_state;
