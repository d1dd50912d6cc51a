//! Inspect command - show the structure of a param/bin network.

use std::path::PathBuf;

use clap::Args;
use console::style;
use serde::Serialize;

use netdeploy_backend::engine::{CustomLayerRegistrar, DeployOps, Net};
use netdeploy_core::{backend_file_count, BackendKind};

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// ncnn param file
    #[arg(long)]
    param: PathBuf,

    /// ncnn bin file; weights are checked when given
    #[arg(long)]
    bin: Option<PathBuf>,

    /// Do not register the deploy-time custom layers
    #[arg(long)]
    no_custom_layers: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct NetworkSummary {
    layers: Vec<LayerSummary>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    blob_count: usize,
    artifact_count: usize,
    weights_loaded: bool,
}

#[derive(Serialize)]
struct LayerSummary {
    #[serde(rename = "type")]
    layer_type: String,
    name: String,
    bottoms: Vec<String>,
    tops: Vec<String>,
}

pub async fn run(args: InspectArgs) -> anyhow::Result<()> {
    let mut net = Net::new();
    if !args.no_custom_layers {
        DeployOps.register_custom_layers(&mut net)?;
    }
    net.load_param(&args.param)
        .map_err(|e| anyhow::anyhow!("{}: {}", args.param.display(), e))?;
    if let Some(bin) = &args.bin {
        net.load_model(bin)
            .map_err(|e| anyhow::anyhow!("{}: {}", bin.display(), e))?;
    }

    let summary = NetworkSummary {
        layers: net
            .layers()
            .map(|l| LayerSummary {
                layer_type: l.layer_type.to_string(),
                name: l.name.to_string(),
                bottoms: l.bottoms.iter().map(|s| s.to_string()).collect(),
                tops: l.tops.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
        inputs: net.input_names(),
        outputs: net.output_names(),
        blob_count: net.blob_count(),
        artifact_count: backend_file_count(BackendKind::Ncnn),
        weights_loaded: net.is_ready(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", style(args.param.display()).bold());
    println!(
        "{} layers, {} blobs, {} artifact files",
        summary.layers.len(),
        summary.blob_count,
        summary.artifact_count
    );
    println!();
    for layer in &summary.layers {
        println!(
            "  {:<24} {:<20} {} -> {}",
            layer.layer_type,
            layer.name,
            layer.bottoms.join(","),
            layer.tops.join(",")
        );
    }
    println!();
    println!("Inputs:  {}", summary.inputs.join(", "));
    println!("Outputs: {}", summary.outputs.join(", "));
    let weights = if summary.weights_loaded {
        style("loaded").green()
    } else {
        style("not checked").yellow()
    };
    println!("Weights: {}", weights);

    Ok(())
}
