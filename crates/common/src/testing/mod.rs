mod test_store;

pub use cmd_util::env::config_test as init_test_logging;
pub use test_store::TestStore;
