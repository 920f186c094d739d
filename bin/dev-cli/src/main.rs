mod fixture;
mod logger;

use std::{env, process, sync::Arc};

use anyhow::Context as _;
use hive_router_fetch_loader::{
    ArenaPool, ArenaPoolConfig, CachingOptions, Context, ErrorBehavior, ExecutionOptions,
    FetchLoader, InMemoryLoaderCache, LoaderCaches, TraceOptions,
};
use hive_router_loader_config::{load_config, resolve::ErrorBehaviorConfig, LoaderConfig};
use tracing::info;

use crate::{fixture::Fixture, logger::configure_logging};

const DEFAULT_CACHE_NAME: &str = "default";

struct RunArgs {
    fixture_path: String,
    config_path: Option<String>,
    trace: bool,
}

fn usage() -> ! {
    eprintln!("Usage: loader-dev-cli run <fixture.json> [--config <path>] [--trace]");
    eprintln!("       loader-dev-cli config-schema");
    process::exit(1);
}

fn parse_run_args(args: &[String]) -> RunArgs {
    let mut fixture_path = None;
    let mut config_path = None;
    let mut trace = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => match iter.next() {
                Some(path) => config_path = Some(path.clone()),
                None => usage(),
            },
            "--trace" => trace = true,
            _ if fixture_path.is_none() => fixture_path = Some(arg.clone()),
            _ => usage(),
        }
    }
    match fixture_path {
        Some(fixture_path) => RunArgs {
            fixture_path,
            config_path,
            trace,
        },
        None => usage(),
    }
}

fn execution_options(config: &LoaderConfig, trace: bool) -> ExecutionOptions {
    ExecutionOptions {
        caching: CachingOptions {
            l1_enabled: config.caching.l1_enabled,
            l2_enabled: config.caching.l2_enabled,
            default_ttl: config.caching.default_ttl,
        },
        trace: TraceOptions {
            enabled: config.trace.enabled || trace,
            exclude_raw_input_data: config.trace.exclude_raw_input_data,
            exclude_input: config.trace.exclude_input,
            exclude_output: config.trace.exclude_output,
            redact_headers: config.trace.redact_headers,
        },
        error_behavior: match config.resolve.error_behavior {
            ErrorBehaviorConfig::Propagate => ErrorBehavior::Propagate,
            ErrorBehaviorConfig::Null => ErrorBehavior::Null,
            ErrorBehaviorConfig::Halt => ErrorBehavior::Halt,
        },
        omit_error_locations: config.resolve.omit_error_locations,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config_path)?;
    configure_logging(&config.log)?;

    let raw = std::fs::read(&args.fixture_path)
        .with_context(|| format!("unable to read fixture {}", args.fixture_path))?;
    let fixture = Fixture::from_slice(&raw)?;

    let arena_pool = ArenaPool::new(ArenaPoolConfig {
        idle_timeout: config.arena_pool.idle_timeout,
        peak_window: config.arena_pool.peak_window,
        min_capacity: config.arena_pool.min_capacity,
    });
    let loader = FetchLoader::new(fixture.data_source_map()?)
        .with_caches(LoaderCaches::new().with(
            DEFAULT_CACHE_NAME,
            Arc::new(InMemoryLoaderCache::new(config.caching.in_memory_max_capacity)),
        ))
        .with_arena_pool(Arc::new(arena_pool));

    let mut builder = Context::builder()
        .headers(fixture.header_map()?)
        .options(execution_options(&config, args.trace));
    if let Some(variables) = &fixture.variables {
        builder = builder.variables(&serde_json::to_vec(variables)?)?;
    }
    if let Some(extensions) = &fixture.extensions {
        builder = builder.extensions(serde_json::to_vec(extensions)?);
    }
    let ctx = builder.build();

    let output = loader.execute(&ctx, &fixture.plan).await?;
    info!(
        errors = output.errors.len(),
        l1_hits = output.cache_stats.l1_hits,
        l2_hits = output.cache_stats.l2_hits,
        "fixture executed"
    );

    println!("{}", String::from_utf8_lossy(&output.body));
    if let Some(trace) = output.trace {
        println!("{}", sonic_rs::to_string_pretty(&trace)?);
    }
    Ok(())
}

fn config_schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(LoaderConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let result = match args[1].as_str() {
        "run" => run(parse_run_args(&args[2..])).await,
        "config-schema" => config_schema(),
        _ => usage(),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_router_loader_config::parse_yaml_config;

    #[test]
    fn maps_config_to_execution_options() {
        let config = parse_yaml_config(
            "caching:\n  l1_enabled: false\nresolve:\n  error_behavior: \"NULL\"\ntrace:\n  redact_headers: false\n",
        )
        .unwrap();

        let options = execution_options(&config, true);

        assert!(!options.caching.l1_enabled);
        assert!(options.caching.l2_enabled);
        assert_eq!(options.error_behavior, ErrorBehavior::Null);
        assert!(options.trace.enabled);
        assert!(!options.trace.redact_headers);
    }

    #[test]
    fn parses_run_arguments() {
        let args: Vec<String> = ["plan.json", "--config", "loader.yaml", "--trace"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let run = parse_run_args(&args);
        assert_eq!(run.fixture_path, "plan.json");
        assert_eq!(run.config_path.as_deref(), Some("loader.yaml"));
        assert!(run.trace);
    }
}
