pub mod adapter_manager;
pub mod bootstrap;
pub mod proxy_manager;
pub mod worker;
