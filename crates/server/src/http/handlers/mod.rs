pub mod comments;
pub mod health;

use crate::guard::Rejection;

/// Fallback for any method a route does not serve.
pub async fn method_not_allowed() -> Rejection {
    Rejection::MethodNotAllowed
}
