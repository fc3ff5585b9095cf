use crate::api::models::LogicalsResponse;
use crate::servers::model::LogicalServer;

pub const RAW_SERVER_LIST: &str = include_str!("../../tests/fixtures/raw_server_list.json");

pub fn raw_server_list() -> Vec<LogicalServer> {
    serde_json::from_str::<LogicalsResponse>(RAW_SERVER_LIST)
        .unwrap()
        .logical_servers
}
