use anyhow::Result;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const RUST_LOG_ENV: &str = "RUST_LOG";

pub fn init_tracing(level: tracing::metadata::LevelFilter, json_format: bool) -> Result<()> {
    let mut filter = EnvFilter::new("")
        .add_directive(Directive::from(level))
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tokio_cron_scheduler=warn".parse()?);

    if let Ok(env) = std::env::var(RUST_LOG_ENV) {
        for directive in env.split(',') {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("WARN ignoring log directive: `{directive}`: {e}"),
            }
        }
    }

    let fmt_layer = fmt::layer().with_target(false);

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::info!("Initialized logger");

    Ok(())
}
