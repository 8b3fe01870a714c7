use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use esp_patcher::patcher::{NoProgress, PatchEvent, ProgressSink};
use esp_patcher::{
    build_patch_from_paths, CancelToken, EspDebugger, PatchConfig, Plugin, Signature,
    SUPPORTED_EXTENSIONS,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esp_patcher")]
#[command(about = "解析、校验并合并 ESP/ESM/ESL 插件")]
#[command(version)]
struct Cli {
    /// 静默模式(仅输出警告和错误)
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 显示插件统计信息
    Info {
        input: PathBuf,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 输出文件结构
    Dump {
        input: PathBuf,
        /// 输出文件(默认 <input>.dump.txt)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 解析后重建，检查是否与原文件逐字节一致
    Rebuild {
        input: PathBuf,
        /// 写出重建文件
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 不一致时写出结构对比
        #[arg(long)]
        compare: Option<PathBuf>,
    },
    /// 按加载顺序合并插件，生成补丁
    Patch {
        /// 输入插件(按优先级从低到高)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// 补丁配置 JSON(默认使用内置配置)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// 输出文件(默认为配置中的补丁名，位于最后一个输入所在目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 只合并指定的记录类型，例如 --only LVLI,NPC_
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// 可以删除列表条目的插件，例如 --delev Deleveler.esp
        #[arg(long, value_delimiter = ',')]
        delev: Vec<String>,
        /// 覆盖已有文件前先备份
        #[arg(long)]
        backup: bool,
        /// 冲突报告 JSON 输出路径
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match &cli.command {
        Command::Info { input, json } => handle_info(input, *json),
        Command::Dump { input, output } => handle_dump(input, output.as_deref()),
        Command::Rebuild {
            input,
            output,
            compare,
        } => handle_rebuild(input, output.as_deref(), compare.as_deref()),
        Command::Patch {
            inputs,
            config,
            output,
            only,
            delev,
            backup,
            report,
        } => {
            let config = load_patch_config(config.as_deref(), only, delev)?;
            handle_patch(&cli, inputs, config, output.as_deref(), *backup, report.as_deref())
        }
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// 验证输入文件
fn validate_input(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("输入文件不存在: {:?}", input);
    }

    let extension = input
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    if !SUPPORTED_EXTENSIONS.iter().any(|&ext| Some(ext) == extension.as_deref()) {
        bail!("输入文件必须是ESP、ESM或ESL文件: {:?}", input);
    }
    Ok(())
}

fn load(input: &Path) -> Result<Plugin> {
    validate_input(input)?;
    Plugin::open(input).with_context(|| format!("无法解析插件 {:?}", input))
}

fn handle_info(input: &Path, json: bool) -> Result<()> {
    let plugin = load(input)?;
    let stats = plugin.get_stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats);
    }
    Ok(())
}

fn handle_dump(input: &Path, output: Option<&Path>) -> Result<()> {
    let plugin = load(input)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("dump.txt"));
    EspDebugger::dump_file_structure(&plugin, &output)
        .with_context(|| format!("写入结构文件失败 {:?}", output))?;
    tracing::info!(path = %output.display(), "结构已输出");
    Ok(())
}

fn handle_rebuild(input: &Path, output: Option<&Path>, compare: Option<&Path>) -> Result<()> {
    validate_input(input)?;
    let original = std::fs::read(input).with_context(|| format!("读取失败 {:?}", input))?;
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let plugin = Plugin::from_bytes(&name, &original)?;

    let check = plugin.verify_roundtrip(&original)?;
    if check.identical {
        println!("✓ 重建结果与原文件一致 ({} bytes)", check.original_len);
    } else {
        println!(
            "✗ 重建结果不一致: 原文件 {} bytes，重建 {} bytes，首个差异位置 {:?}",
            check.original_len, check.rebuilt_len, check.first_difference
        );
    }

    if let Some(output) = output {
        plugin.write_to_file(output)?;
        tracing::info!(path = %output.display(), "重建文件已写入");
    }

    if let (Some(path), false) = (compare, check.identical) {
        let rebuilt = Plugin::from_bytes(&name, &plugin.to_bytes()?)?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        let differences = EspDebugger::compare_structures(&plugin, &rebuilt, &mut file)?;
        tracing::info!(path = %path.display(), differences, "结构对比已输出");
    }

    if !check.identical {
        bail!("重建校验失败");
    }
    Ok(())
}

/// 命令行进度输出
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: &PatchEvent) {
        match event {
            PatchEvent::Started { files } => println!("合并 {} 个插件", files),
            PatchEvent::FileStarted { index, name } => println!("[{}] {}", index + 1, name),
            PatchEvent::FileMerged { records, .. } => println!("    {} 条记录", records),
            PatchEvent::FileSkipped { name, reason, .. } => println!("    跳过 {}: {}", name, reason),
            PatchEvent::Emitting { objects } => println!("生成补丁 ({} 个对象)", objects),
            PatchEvent::Finished { changed, conflicts } => {
                println!("完成: {} 条记录，{} 处冲突", changed, conflicts)
            }
        }
    }
}

fn load_patch_config(config: Option<&Path>, only: &[String], delev: &[String]) -> Result<PatchConfig> {
    let mut config = match config {
        Some(path) => PatchConfig::from_file(path).with_context(|| format!("读取配置失败 {:?}", path))?,
        None => PatchConfig::builtin()?,
    };
    if !only.is_empty() {
        let mut signatures = Vec::with_capacity(only.len());
        for text in only {
            match Signature::parse(text) {
                Some(signature) => signatures.push(signature),
                None => bail!("无效的记录类型: {}", text),
            }
        }
        config = config.enable_only(&signatures);
    }
    for plugin in delev {
        config = config.with_delev(plugin);
    }
    Ok(config)
}

fn handle_patch(
    cli: &Cli,
    inputs: &[PathBuf],
    config: PatchConfig,
    output: Option<&Path>,
    backup: bool,
    report: Option<&Path>,
) -> Result<()> {
    for input in inputs {
        validate_input(input)?;
    }

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => inputs
            .last()
            .and_then(|p| p.parent())
            .unwrap_or_else(|| Path::new("."))
            .join(&config.patch_name),
    };

    let cancel = CancelToken::new();
    let progress: &dyn ProgressSink = if cli.quiet { &NoProgress } else { &ConsoleProgress };
    let patch = build_patch_from_paths(inputs, &config, progress, &cancel)?;

    if let Some(backup_path) = patch.publish(&output, backup)? {
        tracing::info!(path = %backup_path.display(), "已备份原补丁");
    }
    if let Some(path) = report {
        patch.report.write_json(path)?;
        tracing::info!(path = %path.display(), "冲突报告已写入");
    }
    if !cli.quiet {
        print!("{}", patch.report);
        println!("补丁输出到: {:?}", output);
    }
    Ok(())
}
