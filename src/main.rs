use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plan_runner::options::ENV_CDP_ENDPOINT;
use plan_runner::profile::{self, SiteProfile};
use plan_runner::selectors::{load_data_bag, load_selector_map};
use plan_runner::{FormDataBag, Plan, RunOptions, ScreenshotMode, SelectorMap, merge_selector_maps, run_plan};

#[derive(Parser)]
#[command(name = "plan-runner", version, about = "Run browser plans against a live site")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a plan in a browser session.
    Run(RunArgs),
    /// Parse a plan and check it against a profile without running it.
    Validate {
        #[arg(long)]
        plan: PathBuf,
        /// Built-in profile name or profile JSON file.
        #[arg(long)]
        profile: Option<String>,
    },
    /// List the built-in site profiles.
    Profiles,
}

#[derive(Args)]
struct RunArgs {
    /// Built-in profile name or profile JSON file.
    #[arg(long)]
    profile: Option<String>,
    /// Plan JSON; defaults to the profile's template.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Selector map JSON; replaces the profile's table.
    #[arg(long)]
    selectors: Option<PathBuf>,
    /// Suggested selector map, merged in front of the baseline.
    #[arg(long)]
    suggested: Option<PathBuf>,
    /// Data bag JSON, layered over the profile's defaults.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Extra data bag entries.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,
    /// RunOptions JSON.
    #[arg(long)]
    options: Option<PathBuf>,
    /// Remote-debugging endpoint of a running Chrome.
    #[arg(long, env = ENV_CDP_ENDPOINT)]
    cdp: Option<String>,
    #[arg(long)]
    user_data_dir: Option<PathBuf>,
    #[arg(long)]
    headful: bool,
    #[arg(long, value_enum)]
    screenshot_mode: Option<ScreenshotMode>,
    #[arg(long)]
    artifacts: Option<PathBuf>,
    /// Keep the browser open until 'q', Enter or Ctrl+C.
    #[arg(long)]
    keep_open: bool,
    #[arg(long)]
    keep_open_ms: Option<u64>,
    #[arg(long)]
    human_typing: bool,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn load_profile(spec: &str) -> Result<SiteProfile> {
    if let Some(profile) = profile::builtin(spec)? {
        return Ok(profile);
    }
    let path = Path::new(spec);
    if path.exists() {
        return SiteProfile::from_file(path)
            .with_context(|| format!("loading profile {}", path.display()));
    }
    bail!(
        "unknown profile {:?} (built-in: {})",
        spec,
        profile::builtin_names().collect::<Vec<_>>().join(", ")
    )
}

fn load_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    Plan::from_json_at_site(&text).with_context(|| format!("parsing plan {}", path.display()))
}

fn build_options(args: &RunArgs) -> Result<RunOptions> {
    let mut options = match &args.options {
        Some(path) => RunOptions::from_file(path)
            .with_context(|| format!("loading options {}", path.display()))?,
        None => RunOptions::default(),
    };
    options.apply_env();

    if let Some(cdp) = &args.cdp {
        options.connect_endpoint = Some(cdp.clone());
    }
    if let Some(dir) = &args.user_data_dir {
        options.user_data_dir = Some(dir.clone());
    }
    if args.headful {
        options.headless = false;
    }
    if let Some(mode) = args.screenshot_mode {
        options.screenshot_mode = mode;
    }
    if let Some(dir) = &args.artifacts {
        options.artifacts_dir = dir.clone();
    }
    if args.keep_open {
        options.keep_open = true;
    }
    if args.keep_open_ms.is_some() {
        options.keep_open_ms = args.keep_open_ms;
    }
    if args.human_typing {
        options.human_typing = true;
    }
    Ok(options)
}

async fn run(args: RunArgs) -> Result<()> {
    let profile = args.profile.as_deref().map(load_profile).transpose()?;

    let plan = match (&args.plan, &profile) {
        (Some(path), _) => load_plan(path)?,
        (None, Some(p)) => p
            .plan()?
            .ok_or_else(|| anyhow!("profile {} has no plan template; pass --plan", p.name))?,
        (None, None) => bail!("pass --plan or --profile"),
    };

    let mut selectors: SelectorMap = match (&args.selectors, &profile) {
        (Some(path), _) => load_selector_map(path)
            .with_context(|| format!("loading selectors {}", path.display()))?,
        (None, Some(p)) => p.selectors.clone(),
        (None, None) => bail!("pass --selectors or --profile"),
    };
    if let Some(path) = &args.suggested {
        let suggested = load_selector_map(path)
            .with_context(|| format!("loading suggested selectors {}", path.display()))?;
        selectors = merge_selector_maps(&selectors, &suggested);
    }

    let mut data: FormDataBag = profile.as_ref().map(|p| p.data.clone()).unwrap_or_default();
    if let Some(path) = &args.data {
        data.extend(load_data_bag(path).with_context(|| format!("loading data {}", path.display()))?);
    }
    data.extend(args.set.iter().cloned());

    if let Some(p) = &profile {
        plan.validate_against(p)?;
    }

    let options = build_options(&args)?;
    let report = run_plan(&plan, &selectors, &data, &options).await?;
    info!(
        "done: {} steps, {} artifacts in {}, {:.1}s",
        report.steps_completed,
        report.artifacts.len(),
        options.artifacts_dir.display(),
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn validate(plan: &Path, profile: Option<&str>) -> Result<()> {
    let plan = load_plan(plan)?;
    if let Some(spec) = profile {
        let profile = load_profile(spec)?;
        plan.validate_against(&profile)?;
    }
    println!("plan ok: {} steps, goal {:?}", plan.steps.len(), plan.meta.goal);
    Ok(())
}

fn list_profiles() -> Result<()> {
    for p in profile::builtins()? {
        println!("{} ({})", p.name, p.site);
        println!("  keys:   {}", p.logical_keys().collect::<Vec<_>>().join(", "));
        println!("  values: {}", p.value_keys.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plan_runner=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Validate { plan, profile } => validate(&plan, profile.as_deref()),
        Command::Profiles => list_profiles(),
    }
}
