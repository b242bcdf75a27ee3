use std::path::PathBuf;

use clap::Subcommand;
use pagetok_paged_attn::PagedCacheType;

fn parse_cache_type(s: &str) -> Result<PagedCacheType, String> {
    s.parse()
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Encode one or more texts and print the resulting tensors as JSON.
    Encode {
        /// Directory holding `tokenizer.json` and the HuggingFace config files.
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Encode options as JSON, e.g. `{"max_length": 16}`. Flags below take precedence.
        #[arg(long)]
        options: Option<String>,

        /// Do not add the tokenizer's special tokens.
        #[arg(long)]
        no_special_tokens: bool,

        /// Truncate every row to this many tokens.
        #[arg(long)]
        max_length: Option<usize>,

        /// Pad every row to `--max-length`.
        #[arg(long, requires = "max_length")]
        pad_to_max_length: bool,

        /// Second texts of each pair. One value pairs with every text.
        #[arg(long)]
        pair: Vec<String>,

        /// Texts to encode.
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// Decode a sequence of token ids.
    Decode {
        /// Directory holding `tokenizer.json` and the HuggingFace config files.
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Keep special tokens in the output.
        #[arg(long)]
        keep_special_tokens: bool,

        /// Token ids.
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        ids: Vec<i64>,
    },

    /// Render a conversation with the model's chat template.
    Chat {
        /// Directory holding `tokenizer.json` and the HuggingFace config files.
        #[arg(short, long)]
        model_dir: PathBuf,

        /// JSON file with a list of `{"role": ..., "content": ...}` messages.
        #[arg(long)]
        messages: PathBuf,

        /// Append the assistant prefix so the model answers next.
        #[arg(long)]
        add_generation_prompt: bool,

        /// A Jinja template file to use instead of the model's own.
        #[arg(long)]
        chat_template: Option<PathBuf>,
    },

    /// Convert a stateful attention graph to paged attention and print its KV head table.
    KvHeads {
        /// Graph in JSON form.
        #[arg(short, long)]
        graph: PathBuf,

        /// Per-layer block indices and score outputs.
        #[arg(long)]
        per_layer_cache_control: bool,

        /// Inputs for rotating cached keys.
        #[arg(long)]
        allow_cache_rotation: bool,

        /// Write the rewritten graph here.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Allocate a CPU cache with this many blocks to check the table.
        #[arg(long)]
        num_blocks: Option<usize>,

        /// Tokens per cache block.
        #[arg(long, default_value_t = 16)]
        block_size: usize,

        /// Cache element type: `auto`, `f16`, `bf16` or `f32`.
        #[arg(long, default_value = "auto", value_parser = parse_cache_type)]
        cache_type: PagedCacheType,
    },
}
