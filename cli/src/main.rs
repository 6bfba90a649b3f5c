use clap::Parser;
use scatterbrain_core::ProtectedInput;
use scatterbrain_types::{ProtectionMode, RuleSetName};
use serde::Deserialize;
use std::{fs, path::PathBuf};

const YAML_PROFILE_VERSION: u32 = 1;

/// One named recovery profile: which mode to parse the input under, the
/// per-sample import-decryption seed, which mutation rule set to drive the
/// CFG Stepper with, and either a single root or a selective symbol set to
/// recover from.
#[derive(Debug, Deserialize)]
struct YamlProfile {
    version: u32,
    mode: YamlMode,
    /// Hex-encoded 32-bit seed, e.g. `"0x1234ABCD"`.
    imp_decrypt_const: String,
    #[serde(default)]
    mutation_rule_set: YamlRuleSet,
    root_rva: Option<String>,
    #[serde(default)]
    selective_rvas: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum YamlMode {
    Full,
    Headerless,
    Selective,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum YamlRuleSet {
    #[default]
    RuleSet1,
}

fn parse_hex_or_dec(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(trimmed.parse()?)
    }
}

/// Commandline interface for the ScatterBrain recovery engine.
#[derive(Parser, Debug)]
#[command(name = "scatterbrain-cli")]
#[command(about = "Recovers the original control flow and imports of a ScatterBrain-protected PE binary", long_about = None)]
pub struct Cli {
    /// Path to the YAML recovery profile
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: log::LevelFilter,
    /// Protected input binary to recover
    #[arg(long, value_name = "INPUT")]
    pub input_file: PathBuf,
    /// Path the rebuilt PE image is written to
    #[arg(long, value_name = "OUTPUT")]
    pub output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::builder().filter_level(cli.log_level).init();

    let profile_contents = fs::read_to_string(&cli.config)?;
    let profile: YamlProfile = serde_yaml::from_str(&profile_contents)?;
    if profile.version != YAML_PROFILE_VERSION {
        log::error!("invalid profile version: {}, expected {}", profile.version, YAML_PROFILE_VERSION);
        return Ok(());
    }

    let mode = match profile.mode {
        YamlMode::Full => ProtectionMode::Full,
        YamlMode::Headerless => ProtectionMode::Headerless,
        YamlMode::Selective => ProtectionMode::Selective,
    };
    let rule_set = match profile.mutation_rule_set {
        YamlRuleSet::RuleSet1 => RuleSetName::RuleSet1,
    };
    let imp_decrypt_const = parse_hex_or_dec(&profile.imp_decrypt_const)? as u32;

    let bytes = fs::read(&cli.input_file)?;
    log::info!("opening {:?} ({} bytes) under mode {mode:?}", cli.input_file, bytes.len());
    let mut input = ProtectedInput::open(bytes, mode, imp_decrypt_const, rule_set)?;

    log::info!("recovering instruction dispatchers...");
    input.recover_instruction_dispatchers()?;
    log::info!("resolved {} dispatcher sites", input.dispatcher_locs.len());

    log::info!("recovering imports...");
    input.recover_imports_merge()?;
    log::info!("recovered {} unique imports", input.imports.len());

    let root_rva = match (&profile.root_rva, mode) {
        (Some(rva), _) => parse_hex_or_dec(rva)?,
        (None, ProtectionMode::Selective) => 0,
        (None, _) => {
            log::error!("profile must specify `root_rva` for mode {mode:?}");
            return Ok(());
        }
    };

    log::info!("recovering control flow...");
    if matches!(mode, ProtectionMode::Selective) {
        let roots = profile
            .selective_rvas
            .iter()
            .map(|s| parse_hex_or_dec(s))
            .collect::<Result<Vec<_>, _>>()?;
        if roots.is_empty() {
            log::error!("selective mode requires at least one entry in `selective_rvas`");
            return Ok(());
        }
        input.recover_selective(&roots)?;
    } else {
        input.recover_recursive_in_full(root_rva)?;
    }
    log::info!("recovered {} functions", input.cfg.len());

    log::info!("assembling output image...");
    input.rebuild_output()?;
    input.dump_new_image_buffer_to_disk(&cli.output)?;
    log::info!("recovered image written to {:?}", cli.output);

    Ok(())
}
