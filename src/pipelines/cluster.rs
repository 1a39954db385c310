/// Swarm clustering of the globally dereplicated sequences
///
/// With denoising, a pilot pass at distance 1 collapses near-identical reads,
/// its seeds are resized to their cluster abundance and sorted again, and
/// the final pass at the configured distance clusters those seeds.

use std::path::Path;

use log::info;

use crate::config::defs::{PipelineError, SIZE_SEPARATOR};
use crate::config::run::{Clustering, RunConfiguration};
use crate::pipelines::aggregate::GlobalDerep;
use crate::utils::command::CommandInvocation;
use crate::utils::fastx::{aggregate_composition, replace_n_tags, resize_seeds, restore_n_tags};
use crate::utils::file::append_to_log;
use crate::utils::tempfiles::TempFileRegistry;
use crate::utils::tools::{swarm, Tool};

/// Swarm options of a run, `None` in DADA2 mode.
fn swarm_settings(config: &RunConfiguration) -> Option<(usize, bool, bool)> {
    match config.clustering {
        Clustering::Swarm { distance, fastidious, denoising } => Some((distance, fastidious, denoising)),
        Clustering::Dada2 { .. } => None,
    }
}

/// Clusters the global sequences and writes the BIOM, composition and seed
/// FASTA named in `config.outputs`.
///
/// # Arguments
///
/// * `config` - Run options.
/// * `derep` - Output of the global dereplication.
/// * `registry` - Run registry, receives every intermediate file.
pub async fn cluster(
    config: &RunConfiguration,
    derep: &GlobalDerep,
    registry: &mut TempFileRegistry,
) -> Result<(), PipelineError> {
    let (distance, fastidious, denoising) = swarm_settings(config)
        .ok_or_else(|| PipelineError::config("swarm clustering requested in DADA2 mode"))?;
    let log = &config.outputs.log;
    let outputs = &config.outputs;
    let submit = move |tool: Tool| CommandInvocation::new(tool, config).submit(log);

    let sorted = registry.add("swarm_sorted.fasta")?;
    submit(Tool::SortAbundances {
        input: derep.fasta.clone(),
        output: sorted.path.clone(),
        size_separator: SIZE_SEPARATOR.to_string(),
        debug: config.debug,
    })
    .await?;

    let no_n = registry.add("swarm_sorted_NtoA.fasta")?;
    log_n_tags("replace 100 N tags by 50A-50C in", &sorted.path, &no_n.path, log)?;
    replace_n_tags(&sorted.path, &no_n.path)?;

    let mut to_cluster = no_n.path.clone();
    let mut pilot_composition = None;
    if denoising {
        let composition = registry.add("swarm_denoising_composition.txt")?;
        let pilot_log = registry.add("swarm_denoising_log.txt")?;
        submit(Tool::Swarm(swarm::Params {
            input: no_n.path.clone(),
            composition: composition.path.clone(),
            log: pilot_log.path,
            distance: 1,
            fastidious: false,
            threads: config.nb_cpus,
        }))
        .await?;

        let seeds = registry.add("swarm_denoising_seeds.fasta")?;
        submit(Tool::ExtractSwarmsFasta {
            input: no_n.path.clone(),
            composition: composition.path.clone(),
            output: seeds.path.clone(),
        })
        .await?;

        let resized = registry.add("swarm_denoising_resizedSeeds.fasta")?;
        resize_seeds(&seeds.path, &composition.path, &resized.path)?;

        let sorted_seeds = registry.add("swarm_denoising_sortedSeeds.fasta")?;
        submit(Tool::SortAbundances {
            input: resized.path,
            output: sorted_seeds.path.clone(),
            size_separator: "_".to_string(),
            debug: config.debug,
        })
        .await?;
        to_cluster = sorted_seeds.path;
        pilot_composition = Some(composition.path);
    }

    // The final composition goes to the output unless it has to be expanded.
    let final_composition = match pilot_composition {
        Some(_) => registry.add(&format!("swarm_swarmD{}_composition.txt", distance))?.path,
        None => outputs.composition.clone(),
    };
    let swarm_log = registry.add("swarm_log.txt")?;
    submit(Tool::Swarm(swarm::Params {
        input: to_cluster.clone(),
        composition: final_composition.clone(),
        log: swarm_log.path,
        distance,
        fastidious,
        threads: config.nb_cpus,
    }))
    .await?;

    if let Some(pilot) = &pilot_composition {
        aggregate_composition(pilot, &final_composition, &outputs.composition)?;
    }

    submit(Tool::Swarm2Biom {
        composition: outputs.composition.clone(),
        count: derep.count.clone(),
        biom: outputs.biom.clone(),
    })
    .await?;

    let seeds = registry.add("swarm_final_seeds.fasta")?;
    submit(Tool::ExtractSwarmsFasta {
        input: to_cluster,
        composition: final_composition,
        output: seeds.path.clone(),
    })
    .await?;

    log_n_tags("replace 50A-50C tags by N. in", &seeds.path, &outputs.fasta, log)?;
    restore_n_tags(&seeds.path, &outputs.fasta)?;
    info!("Clustering written to {}", outputs.biom.display());
    Ok(())
}

fn log_n_tags(action: &str, input: &Path, output: &Path, log: &Path) -> Result<(), PipelineError> {
    append_to_log(log, &format!("{}: {} out : {}\n", action, input.display(), output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swarm_settings() {
        let config = RunConfiguration {
            clustering: Clustering::Swarm { distance: 3, fastidious: false, denoising: true },
            ..Default::default()
        };
        assert_eq!(swarm_settings(&config), Some((3, false, true)));
        let dada2 = RunConfiguration { clustering: Clustering::Dada2 { pseudo_pooling: false }, ..Default::default() };
        assert_eq!(swarm_settings(&dada2), None);
    }

    #[tokio::test]
    async fn test_cluster_rejects_dada2_mode() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let mut registry = TempFileRegistry::new(dir.path(), "run_", false)?;
        let config = RunConfiguration { clustering: Clustering::Dada2 { pseudo_pooling: false }, ..Default::default() };
        let derep = GlobalDerep { fasta: dir.path().join("d.fasta"), count: dir.path().join("c.tsv"), nb_seq: 1 };
        assert!(cluster(&config, &derep, &mut registry).await.is_err());
        Ok(())
    }
}
