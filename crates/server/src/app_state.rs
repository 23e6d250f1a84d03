use storage::Storage;

use crate::conversations::Conversations;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) storage: Storage,
    pub(crate) conversations: Conversations,
}
