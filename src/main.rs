use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use segment_query::config::FieldMappingConfig;
use segment_query::{ConfigError, SegmentCompiler};

const FIELD_MAPPING_FILE: &str = "field_mapping.json";

/// 创建编译器实例，优先使用JSON字段映射，文件不存在时使用内置白名单
fn create_compiler_with_config() -> Result<SegmentCompiler> {
    match FieldMappingConfig::from_json_file(FIELD_MAPPING_FILE) {
        Ok(mapping) => {
            println!("✅ 成功从JSON配置文件加载字段映射");
            println!("✅ 加载了 {} 个额外字段", mapping.get_mappings().len());
            for (field, spec) in mapping.get_mappings() {
                println!("  {} -> {} ({})", field, spec.column, spec.field_type);
            }
            SegmentCompiler::from_config(mapping.into_compiler_config())
                .context("field mapping rejected")
        }
        Err(ConfigError::NotFound(_)) => {
            println!("⚠️ 未找到 {}, 使用内置字段白名单", FIELD_MAPPING_FILE);
            Ok(SegmentCompiler::new())
        }
        Err(e) => Err(e).context("failed to load field mapping"),
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segment_query=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

fn compile_files(compiler: &SegmentCompiler, paths: &[String]) -> Result<()> {
    for path in paths {
        let json = fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
        let query = compiler
            .compile_json(&json)
            .with_context(|| format!("cannot compile {}", path))?;
        println!("-- {}", path);
        println!("{}", query);
    }
    Ok(())
}

fn run_repl(compiler: &SegmentCompiler) -> Result<()> {
    println!("每行输入一个JSON分群条件树, 输入 :q 退出");

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("segment> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input == ":q" {
                    break;
                }
                editor.add_history_entry(input)?;

                match compiler.compile_json(input) {
                    Ok(query) => println!("{}", query),
                    Err(e) => println!("✗ 编译失败: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing()?;

    println!("--- Segment Query: 分群条件树到 SQL 编译器 ---");
    let compiler = create_compiler_with_config()?;

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        run_repl(&compiler)
    } else {
        compile_files(&compiler, &paths)
    }
}
