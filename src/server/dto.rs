use serde::{Deserialize, Serialize};

use crate::coordinator::TurnRecord;
use crate::ids::GameId;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IsAliveResponse {
    pub auth_version: u32,
    pub chat_version: u32,
}

impl Default for IsAliveResponse {
    fn default() -> Self {
        Self {
            auth_version: 1,
            chat_version: 0,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub game_id: GameId,
    pub turns: Vec<TurnRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRequest {
    pub whitelisted: bool,
    #[serde(default)]
    pub remark: Option<String>,
}
