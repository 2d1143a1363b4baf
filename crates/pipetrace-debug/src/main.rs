use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use pipetrace::pipe::Format;
use pipetrace_protocol::{
    Client, ContextInfo, DrawRule, Event, ShaderInfo, TextureData, TextureInfo, BLOCK_AFTER,
    BLOCK_BEFORE, BLOCK_MASK, BLOCK_RULE, DEFAULT_PORT,
};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(
    name = "pipetrace-debug",
    about = "Inspect and control a traced graphics process over its remote debug port."
)]
struct Cli {
    /// Debug server address
    #[arg(long, value_name = "HOST:PORT", default_value_t = default_addr())]
    addr: String,

    /// Print replies as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

fn default_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server answers
    Ping,
    /// List live contexts
    Contexts,
    /// Show a context's bindings and block state
    Context { context: u64 },
    /// Pause draws on a context (before the draw by default)
    Block {
        context: u64,
        #[command(flatten)]
        flags: PhaseFlags,
    },
    /// Release the paused draw and keep blocking (all phases by default)
    Step {
        context: u64,
        #[command(flatten)]
        flags: PhaseFlags,
    },
    /// Release the paused draw and stop blocking (all phases by default)
    Unblock {
        context: u64,
        #[command(flatten)]
        flags: PhaseFlags,
    },
    /// Block only draws that use one of the named objects
    Rule {
        context: u64,
        #[arg(long, value_name = "ID")]
        vertex: Option<u64>,
        #[arg(long, value_name = "ID")]
        fragment: Option<u64>,
        #[arg(long, value_name = "ID")]
        texture: Option<u64>,
        #[arg(long, value_name = "ID")]
        surface: Option<u64>,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        before: bool,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        after: bool,
    },
    /// Flush a context
    Flush { context: u64 },
    /// List live textures
    Textures,
    /// Show a texture's layout
    Texture { texture: u64 },
    /// Read back a texture region into a file (PNG when the path ends in .png)
    Read(ReadArgs),
    /// List a context's shaders
    Shaders { context: u64 },
    /// Show a shader's program text
    Shader { context: u64, shader: u64 },
    /// Skip draws that use the shader
    Disable { context: u64, shader: u64 },
    /// Stop skipping draws that use the shader
    Enable { context: u64, shader: u64 },
    /// Swap in a different program, or restore the original
    Replace {
        context: u64,
        shader: u64,
        /// File holding the replacement program text
        #[arg(long, value_name = "PATH", conflicts_with = "restore", required_unless_present = "restore")]
        file: Option<PathBuf>,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        restore: bool,
    },
    /// Print draw-blocked events until interrupted
    Watch,
}

#[derive(Args, Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseFlags {
    #[arg(long, action = clap::ArgAction::SetTrue)]
    before: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    after: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    rule: bool,
}

impl PhaseFlags {
    fn bits(self, default: u32) -> u32 {
        let bits = (if self.before { BLOCK_BEFORE } else { 0 })
            | (if self.after { BLOCK_AFTER } else { 0 })
            | (if self.rule { BLOCK_RULE } else { 0 });
        if bits == 0 {
            default
        } else {
            bits
        }
    }
}

#[derive(Args, Debug)]
struct ReadArgs {
    texture: u64,
    #[arg(long, default_value_t = 0)]
    level: u32,
    #[arg(long, default_value_t = 0)]
    face: u32,
    #[arg(long, default_value_t = 0)]
    zslice: u32,
    #[arg(long, default_value_t = 0)]
    x: u32,
    #[arg(long, default_value_t = 0)]
    y: u32,
    /// Region width (0 reads to the edge of the level)
    #[arg(long, default_value_t = 0)]
    width: u32,
    /// Region height (0 reads to the edge of the level)
    #[arg(long, default_value_t = 0)]
    height: u32,
    #[arg(long, value_name = "PATH")]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    pipetrace::logging::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut client =
        Client::connect(&cli.addr).with_context(|| format!("connect to {}", cli.addr))?;
    tracing::debug!(addr = %cli.addr, "connected");
    let out = Output { json: cli.json };

    match cli.command {
        Command::Ping => {
            client.ping().context("ping")?;
            out.print(json!({ "ok": true }), || "pong".to_owned());
        }
        Command::Contexts => {
            let ids = client.context_list().context("list contexts")?;
            out.print(json!(ids), || id_lines(&ids));
        }
        Command::Context { context } => {
            let info = client
                .context_info(context)
                .with_context(|| format!("context {context}"))?;
            out.print(context_json(&info), || context_text(context, &info));
        }
        Command::Block { context, flags } => {
            client.draw_block(context, flags.bits(BLOCK_BEFORE))?;
            out.ack();
        }
        Command::Step { context, flags } => {
            client.draw_step(context, flags.bits(BLOCK_MASK))?;
            out.ack();
        }
        Command::Unblock { context, flags } => {
            client.draw_unblock(context, flags.bits(BLOCK_MASK))?;
            out.ack();
        }
        Command::Rule {
            context,
            vertex,
            fragment,
            texture,
            surface,
            before,
            after,
        } => {
            let block = PhaseFlags {
                before,
                after,
                rule: false,
            }
            .bits(BLOCK_BEFORE);
            let rule = DrawRule {
                vertex: vertex.unwrap_or(0),
                fragment: fragment.unwrap_or(0),
                texture: texture.unwrap_or(0),
                surface: surface.unwrap_or(0),
                block,
            };
            client.draw_rule(context, rule)?;
            out.ack();
        }
        Command::Flush { context } => {
            client.flush(context)?;
            out.ack();
        }
        Command::Textures => {
            let ids = client.texture_list().context("list textures")?;
            out.print(json!(ids), || id_lines(&ids));
        }
        Command::Texture { texture } => {
            let info = client
                .texture_info(texture)
                .with_context(|| format!("texture {texture}"))?;
            out.print(texture_json(&info), || texture_text(texture, &info));
        }
        Command::Read(args) => read_texture(&mut client, &out, &args)?,
        Command::Shaders { context } => {
            let ids = client.shader_list(context)?;
            out.print(json!(ids), || id_lines(&ids));
        }
        Command::Shader { context, shader } => {
            let info = client
                .shader_info(context, shader)
                .with_context(|| format!("shader {shader} on context {context}"))?;
            out.print(shader_json(&info), || shader_text(shader, &info));
        }
        Command::Disable { context, shader } => {
            client.shader_disable(context, shader, true)?;
            out.ack();
        }
        Command::Enable { context, shader } => {
            client.shader_disable(context, shader, false)?;
            out.ack();
        }
        Command::Replace {
            context,
            shader,
            file,
            restore,
        } => {
            let source = match (file, restore) {
                (_, true) => None,
                (Some(path), false) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?,
                ),
                (None, false) => bail!("either --file or --restore is required"),
            };
            client.shader_replace(context, shader, source)?;
            out.ack();
        }
        Command::Watch => loop {
            match client.next_event(None)? {
                Some(Event::DrawBlocked { context, blocked }) => out.print(
                    json!({ "event": "draw_blocked", "context": context, "blocked": blocked }),
                    || format!("context {context}: draw blocked ({})", block_names(blocked)),
                ),
                None => continue,
            }
        },
    }
    Ok(())
}

struct Output {
    json: bool,
}

impl Output {
    fn print(&self, value: serde_json::Value, text: impl FnOnce() -> String) {
        if self.json {
            println!("{value}");
        } else {
            println!("{}", text());
        }
    }

    fn ack(&self) {
        if self.json {
            println!("{}", json!({ "ok": true }));
        }
    }
}

fn id_lines(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn block_names(bits: u32) -> String {
    let names: Vec<&str> = [
        (BLOCK_BEFORE, "before"),
        (BLOCK_AFTER, "after"),
        (BLOCK_RULE, "rule"),
    ]
    .into_iter()
    .filter(|(bit, _)| bits & bit != 0)
    .map(|(_, name)| name)
    .collect();
    if names.is_empty() {
        "none".to_owned()
    } else {
        names.join(",")
    }
}

fn format_name(id: u32) -> String {
    Format::from_u32(id).map_or_else(|| format!("format#{id}"), |f| format!("{f:?}"))
}

fn stage_name(stage: u32) -> &'static str {
    match stage {
        0 => "vertex",
        1 => "fragment",
        _ => "unknown",
    }
}

fn context_json(info: &ContextInfo) -> serde_json::Value {
    json!({
        "vertex": info.vertex,
        "fragment": info.fragment,
        "fragment_textures": info.fragment_textures,
        "vertex_textures": info.vertex_textures,
        "cbufs": info.cbufs,
        "zsbuf": info.zsbuf,
        "blocker": info.blocker,
        "blocked": info.blocked,
    })
}

fn context_text(id: u64, info: &ContextInfo) -> String {
    format!(
        "context {id}\n  vertex shader:     {}\n  fragment shader:   {}\n  vertex textures:   {:?}\n  fragment textures: {:?}\n  color buffers:     {:?}\n  depth buffer:      {}\n  blocker:           {}\n  blocked:           {}",
        info.vertex,
        info.fragment,
        info.vertex_textures,
        info.fragment_textures,
        info.cbufs,
        info.zsbuf,
        block_names(info.blocker),
        block_names(info.blocked),
    )
}

fn texture_json(info: &TextureInfo) -> serde_json::Value {
    json!({
        "target": info.target,
        "format": info.format,
        "format_name": format_name(info.format),
        "levels": info.levels,
        "block_width": info.block_width,
        "block_height": info.block_height,
        "block_size": info.block_size,
        "last_level": info.last_level,
        "nr_samples": info.nr_samples,
        "bind": info.bind,
        "usage": info.usage,
    })
}

fn texture_text(id: u64, info: &TextureInfo) -> String {
    let mut text = format!(
        "texture {id}\n  format:  {} ({}x{} blocks of {} bytes)\n  samples: {}\n  bind:    {:#x}",
        format_name(info.format),
        info.block_width,
        info.block_height,
        info.block_size,
        info.nr_samples,
        info.bind,
    );
    for (level, [w, h, d]) in info.levels.iter().enumerate() {
        text.push_str(&format!("\n  level {level}: {w}x{h}x{d}"));
    }
    text
}

fn shader_json(info: &ShaderInfo) -> serde_json::Value {
    json!({
        "stage": stage_name(info.stage),
        "disabled": info.disabled,
        "original": info.original,
        "replaced": info.replaced,
    })
}

fn shader_text(id: u64, info: &ShaderInfo) -> String {
    let mut text = format!(
        "shader {id} ({}{})\n{}",
        stage_name(info.stage),
        if info.disabled { ", disabled" } else { "" },
        info.original
    );
    if let Some(replaced) = &info.replaced {
        text.push_str("\n--- replaced with ---\n");
        text.push_str(replaced);
    }
    text
}

fn read_texture(client: &mut Client, out: &Output, args: &ReadArgs) -> anyhow::Result<()> {
    let info = client
        .texture_info(args.texture)
        .with_context(|| format!("texture {}", args.texture))?;
    let [level_w, _, _] = *info
        .levels
        .get(args.level as usize)
        .ok_or_else(|| anyhow!("texture {} has no level {}", args.texture, args.level))?;
    let data = client
        .texture_read(
            args.texture,
            args.face,
            args.level,
            args.zslice,
            args.x,
            args.y,
            args.width,
            args.height,
        )
        .with_context(|| format!("read texture {}", args.texture))?;

    let width = match args.width {
        0 => level_w.saturating_sub(args.x),
        w => w.min(level_w.saturating_sub(args.x)),
    };
    let as_png = args
        .out
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
    let height = if as_png {
        write_png(&args.out, &data, width)?
    } else {
        std::fs::write(&args.out, &data.data)
            .with_context(|| format!("write {}", args.out.display()))?;
        row_count(&data)
    };

    out.print(
        json!({
            "path": args.out.display().to_string(),
            "width": width,
            "height": height,
            "stride": data.stride,
            "bytes": data.data.len(),
        }),
        || {
            format!(
                "wrote {} ({width}x{height}, stride {}, {} bytes)",
                args.out.display(),
                data.stride,
                data.data.len()
            )
        },
    );
    Ok(())
}

fn row_count(data: &TextureData) -> u32 {
    match data.stride {
        0 => 0,
        stride => (data.data.len() / stride as usize) as u32,
    }
}

/// Converts 8-bit four-channel rows to tightly packed RGBA. Returns the row count.
fn to_rgba8(data: &TextureData, width: u32) -> anyhow::Result<(Vec<u8>, u32)> {
    let format = Format::from_u32(data.format);
    let (swap_rb, opaque) = match format {
        Some(Format::R8G8B8A8Unorm) => (false, false),
        Some(Format::B8G8R8A8Unorm) => (true, false),
        Some(Format::B8G8R8X8Unorm) => (true, true),
        _ => bail!(
            "{} cannot be written as PNG; use a raw output path",
            format_name(data.format)
        ),
    };

    let row_bytes = width as usize * 4;
    if (data.stride as usize) < row_bytes {
        bail!("stride {} is smaller than a {width}-pixel row", data.stride);
    }
    let rows = row_count(data);
    let mut rgba = Vec::with_capacity(row_bytes * rows as usize);
    for row in data.data.chunks_exact(data.stride as usize) {
        for px in row[..row_bytes].chunks_exact(4) {
            let (r, b) = if swap_rb { (px[2], px[0]) } else { (px[0], px[2]) };
            let a = if opaque { 0xff } else { px[3] };
            rgba.extend_from_slice(&[r, px[1], b, a]);
        }
    }
    Ok((rgba, rows))
}

fn write_png(path: &Path, data: &TextureData, width: u32) -> anyhow::Result<u32> {
    let (rgba, height) = to_rgba8(data, width)?;
    if width == 0 || height == 0 {
        bail!("texture region is empty");
    }

    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().context("write png header")?;
    writer.write_image_data(&rgba).context("write png data")?;
    writer.finish().context("finish png")?;
    Ok(height)
}
