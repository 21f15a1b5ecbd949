//! The seam to the external authenticator: a bearer token arrives in the
//! connection's query string and resolves to a user id, or the connection
//! is rejected with close code 4001 by the caller.

use log::error;

use crate::data::UserId;
use crate::db_task::Store;

pub async fn authenticate(store: &Store, token: Option<&str>) -> Option<UserId> {
    let token = token?;
    if token.is_empty() {
        return None;
    }
    match store.lookup_session(token).await {
        Ok(user) => user,
        Err(e) => {
            error!("session lookup failed: {e:?}");
            None
        }
    }
}
