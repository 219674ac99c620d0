mod ch_client;

pub use ch_client::ClickHouseClient;
