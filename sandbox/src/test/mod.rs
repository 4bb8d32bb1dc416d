mod sandbox;

pub fn init() {
    env_logger::builder().is_test(true).try_init().ok();
}
