test_r::enable!();

#[path = "it_tests/api_keys.rs"]
mod api_keys;
#[path = "it_tests/config_env.rs"]
mod config_env;
#[path = "it_tests/fakes.rs"]
mod fakes;
#[path = "it_tests/launcher.rs"]
mod launcher;
#[path = "it_tests/lifecycle.rs"]
mod lifecycle;
#[path = "it_tests/uploads.rs"]
mod uploads;
