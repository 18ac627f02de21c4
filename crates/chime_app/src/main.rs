use chime_app::app::{run, AppConfig};

fn main() {
    tracing_subscriber::fmt::init();
    let config = AppConfig::from_env().unwrap_or_default();
    match run(config) {
        Ok(arrived) => {
            for incoming in arrived {
                println!("{}", incoming.id().unwrap_or("<no id>"));
            }
        }
        Err(err) => eprintln!("Failed to run chime demo: {err:#}"),
    }
}
