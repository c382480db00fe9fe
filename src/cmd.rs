use std::fs::File;
use std::io::{self, Write};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::graph::{Graph, StoredImage};
use crate::vfs::VfsDriver;

/// Inspect and manipulate a local image graph store.
#[derive(Parser)]
#[command(name = "layergraph", version)]
pub struct Cli {
    /// Store home
    ///
    /// Graph metadata lives in `<home>/graph`, driver layers in
    /// `<home>/layers`.
    #[arg(long, env = "LAYERGRAPH_HOME", default_value = "/var/lib/layergraph")]
    home: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered images
    List,
    /// Show the metadata of one image
    Info {
        /// Full id or unambiguous prefix
        name: String,
    },
    /// Delete an image and its driver layer
    Delete {
        /// Full id or unambiguous prefix
        name: String,
    },
    /// Ingest a bundle archive (gzip/bzip2/xz/raw tar)
    Import {
        /// Bundle file, or `-` for stdin
        bundle: Utf8PathBuf,
    },
    /// Export an image's layer as an uncompressed tar
    Export {
        /// Full id or unambiguous prefix
        name: String,
        /// Output file, or `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: Utf8PathBuf,
    },
}

pub fn run(cli: &Cli) -> Result<()> {
    let driver = VfsDriver::new(cli.home.join("layers")).context("initializing vfs driver")?;
    let graph =
        Graph::open(cli.home.join("graph"), Box::new(driver)).context("opening graph store")?;

    match &cli.command {
        Command::List => list(&graph),
        Command::Info { name } => info(&graph, name),
        Command::Delete { name } => {
            graph.delete(name)?;
            println!("deleted {name}");
            Ok(())
        }
        Command::Import { bundle } => import(&graph, bundle),
        Command::Export { name, output } => export(&graph, name, output),
    }
}

fn describe(image: &StoredImage) -> String {
    match image {
        StoredImage::Layered(layered) => match &layered.image.parent {
            Some(parent) => format!("layered  parent {}", &parent[..12]),
            None => "layered  base".to_string(),
        },
        StoredImage::Bundle(b) => format!("bundle   {}", b.manifest.name),
    }
}

fn list(graph: &Graph) -> Result<()> {
    let heads = graph.heads();
    let mut rows: Vec<(String, StoredImage)> = graph
        .map()
        .into_iter()
        .map(|(id, layered)| (id, StoredImage::Layered(layered)))
        .chain(
            graph
                .map_bundles()
                .into_iter()
                .map(|(id, b)| (id, StoredImage::Bundle(b))),
        )
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    for (id, image) in rows {
        let head = if heads.contains_key(&id) { "head" } else { "    " };
        println!(
            "{}  {}  {:>10}  {}",
            &id[..12],
            head,
            image.size(),
            describe(&image)
        );
    }
    Ok(())
}

fn info(graph: &Graph, name: &str) -> Result<()> {
    match graph.get(name)? {
        StoredImage::Layered(layered) => {
            let json = serde_json::to_string_pretty(&layered.image)
                .context("serializing image metadata")?;
            println!("{json}");
            println!("size: {}", layered.size);
        }
        StoredImage::Bundle(b) => {
            let json = serde_json::to_string_pretty(&b.manifest)
                .context("serializing bundle manifest")?;
            println!("{json}");
            println!("id: {}", b.id);
            println!("parents: {}", b.parents.join(", "));
            println!("size: {}", b.size);
        }
    }
    Ok(())
}

fn import(graph: &Graph, bundle: &Utf8PathBuf) -> Result<()> {
    let result = if bundle.as_str() == "-" {
        graph.register_bundle(&mut io::stdin().lock())
    } else {
        let mut file =
            File::open(bundle).with_context(|| format!("opening bundle {bundle}"))?;
        graph.register_bundle(&mut file)
    };
    let (manifest, id) = result?;
    println!("{}  {}", id, manifest.name);
    Ok(())
}

fn export(graph: &Graph, name: &str, output: &Utf8PathBuf) -> Result<()> {
    let mut archive = graph.temp_layer_archive(name, None)?;
    if output.as_str() == "-" {
        io::copy(&mut archive, &mut io::stdout().lock()).context("writing layer to stdout")?;
    } else {
        let mut file =
            File::create(output).with_context(|| format!("creating output file {output}"))?;
        io::copy(&mut archive, &mut file).context("writing layer")?;
        file.flush().context("flushing output")?;
    }
    Ok(())
}
