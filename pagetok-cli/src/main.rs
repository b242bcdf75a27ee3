use std::{fs, num::NonZeroUsize, path::Path};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use clap::Parser;
use pagetok_core::{
    initialize_logging, BackendContext, ChatMessage, CompileOptions, DecodeOptions,
    EncodeInput, EncodeOptions, HfTokenizerGraph, HfTokenizersBackend, TokenizerSession,
};
use pagetok_paged_attn::{
    apply_paged_attention_transformations, CacheConfig, CacheEngine, Graph, PagedAttentionFlags,
};
use serde::Serialize;
use tracing::info;

mod command;

use command::Command;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Requests per tokenizer pool. Defaults to the available parallelism.
    #[arg(long)]
    concurrency: Option<usize>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Serialize)]
struct EncodeOutput {
    input_ids: Vec<Vec<i64>>,
    attention_mask: Vec<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type_ids: Option<Vec<Vec<i64>>>,
}

fn load_session(ctx: &BackendContext<HfTokenizersBackend>, dir: &Path) -> Result<TokenizerSession> {
    let (tokenizer, detokenizer) = HfTokenizerGraph::from_file(dir.join("tokenizer.json"))
        .with_context(|| format!("loading `{}`", dir.join("tokenizer.json").display()))?;
    TokenizerSession::new(ctx, Some(&tokenizer), Some(&detokenizer), Some(dir))
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();

    let concurrency = match args.concurrency {
        Some(0) => bail!("`concurrency` must be a strictly positive integer, got 0."),
        Some(x) => NonZeroUsize::new(x),
        None => None,
    };
    let ctx = BackendContext::new(HfTokenizersBackend).with_options(CompileOptions {
        concurrency,
        ..Default::default()
    });

    match args.command {
        Command::Encode {
            model_dir,
            options,
            no_special_tokens,
            max_length,
            pad_to_max_length,
            pair,
            texts,
        } => {
            let mut opts: EncodeOptions = match options {
                Some(json) => serde_json::from_str(&json).context("parsing `--options`")?,
                None => EncodeOptions::default(),
            };
            if no_special_tokens {
                opts.add_special_tokens = Some(false);
            }
            if max_length.is_some() {
                opts.max_length = max_length;
            }
            if pad_to_max_length {
                opts.pad_to_max_length = Some(true);
            }

            let input = if pair.is_empty() {
                EncodeInput::Batch(texts)
            } else {
                EncodeInput::Paired(texts, pair)
            };
            let session = load_session(&ctx, &model_dir)?;
            let encoded = session.encode(input, &opts)?;
            let output = EncodeOutput {
                input_ids: encoded.input_ids.to_vec2()?,
                attention_mask: encoded.attention_mask.to_vec2()?,
                token_type_ids: encoded
                    .token_type_ids
                    .map(|t| t.to_vec2())
                    .transpose()?,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Decode {
            model_dir,
            keep_special_tokens,
            ids,
        } => {
            let session = load_session(&ctx, &model_dir)?;
            let opts = DecodeOptions::new().with_skip_special_tokens(!keep_special_tokens);
            println!("{}", session.decode(&ids, &opts)?);
        }
        Command::Chat {
            model_dir,
            messages,
            add_generation_prompt,
            chat_template,
        } => {
            let raw = fs::read_to_string(&messages)
                .with_context(|| format!("reading `{}`", messages.display()))?;
            let history: Vec<ChatMessage> = serde_json::from_str(&raw)?;
            let template = chat_template
                .map(|path| {
                    fs::read_to_string(&path)
                        .with_context(|| format!("reading `{}`", path.display()))
                })
                .transpose()?;

            let session = load_session(&ctx, &model_dir)?;
            let prompt =
                session.apply_chat_template(&history, add_generation_prompt, template.as_deref())?;
            println!("{prompt}");
        }
        Command::KvHeads {
            graph,
            per_layer_cache_control,
            allow_cache_rotation,
            output,
            num_blocks,
            block_size,
            cache_type,
        } => {
            let raw = fs::read(&graph).with_context(|| format!("reading `{}`", graph.display()))?;
            let mut model: Graph = serde_json::from_slice(&raw)?;
            let flags = PagedAttentionFlags {
                per_layer_cache_control,
                allow_cache_rotation,
            };
            let kv_head_configs = apply_paged_attention_transformations(&mut model, flags)?;
            println!("{}", serde_json::to_string_pretty(&kv_head_configs)?);

            if let Some(num_blocks) = num_blocks {
                let cache_config = CacheConfig {
                    block_size,
                    num_blocks,
                    cache_type,
                };
                let engine =
                    CacheEngine::new(&kv_head_configs, &cache_config, DType::F32, &Device::Cpu)?;
                info!(
                    "Allocated {} layers of {} blocks x {} tokens ({} bytes per block).",
                    engine.num_layers(),
                    engine.num_blocks(),
                    engine.block_size(),
                    CacheEngine::bytes_per_block(
                        &kv_head_configs,
                        cache_type.to_dtype(DType::F32),
                        block_size
                    ),
                );
            }
            if let Some(path) = output {
                fs::write(&path, serde_json::to_vec_pretty(&model)?)
                    .with_context(|| format!("writing `{}`", path.display()))?;
                info!("Wrote paged graph to `{}`.", path.display());
            }
        }
    }
    Ok(())
}
