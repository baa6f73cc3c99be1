use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use urlremap::config::RemapConfig;
use urlremap::core::{DnsResolver, HostResolver, StaticResolver};
use urlremap::rewrite::{RuleClass, UrlRewriter};

/// Compile a remap rule file and report what the table would contain.
#[derive(Parser)]
#[command(name = "urlremap", version, about = "Remap rule table checker")]
struct Args {
    /// Service configuration (YAML).
    #[arg(short, long)]
    config: String,

    /// Rule file to compile; defaults to the configured rule_file.
    #[arg(long)]
    rules: Option<String>,

    /// Skip A-record expansion for tunnel/mms rules.
    #[arg(long)]
    no_dns: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match RemapConfig::load_from_yaml(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let resolver: Arc<dyn HostResolver> = if args.no_dns {
        Arc::new(StaticResolver::new())
    } else {
        match DnsResolver::from_system() {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => {
                log::warn!("{e}; continuing without DNS expansion");
                Arc::new(StaticResolver::new())
            }
        }
    };

    let rule_file = args.rules.unwrap_or_else(|| config.rule_file.clone());
    let rewriter = UrlRewriter::new(config, resolver);

    match rewriter.build_from_file(&rule_file) {
        Ok(report) => {
            for class in RuleClass::ALL {
                println!("{:<20} {} rules", class.as_str(), report.rules_for(class));
            }
            println!("{:<20} {} lines", "skipped", report.skipped);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
