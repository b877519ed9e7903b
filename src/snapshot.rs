//! Saving and restoring a finished analysis.
//!
//! Building the tables is the slow part of a run. A snapshot keeps them
//! together with the programs and operations so that later runs only redo
//! the layer naming, which may use different settings.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AnalysisContext, AnalysisSession, AnalysisTables},
    error::{AnalysisError, AnalysisResult},
    layers::{NamingConfig, RegexLayerNamer},
    operation::OperationList,
    program::Program,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: AnalysisTables,
    pub programs: Vec<Program>,
    pub operations: OperationList,
}

impl Snapshot {
    /// Captures the analysis with the variables of every operation, since
    /// a later naming pass may move any of them into a layer.
    pub fn capture(ctx: &AnalysisContext, operations: &OperationList) -> Self {
        let mut operations = operations.clone();
        operations.populate_vars(true);
        let mut programs: Vec<Program> = ctx.programs().cloned().collect();
        programs.sort_by_key(|p| p.id);
        Self {
            tables: ctx.tables().clone(),
            programs,
            operations,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> AnalysisResult<()> {
        log::info!("Saving analysis to {}", path.as_ref().display());
        let file = fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> AnalysisResult<Self> {
        log::info!("Loading analysis from {}", path.as_ref().display());
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Rebuilds the context without analysing the profile again and reruns
    /// the layer naming with `naming`.
    pub fn restore(
        self,
        naming: &NamingConfig,
        threads: usize,
    ) -> AnalysisResult<(AnalysisContext, OperationList)> {
        let namer = RegexLayerNamer::new(naming)?;
        let mut session = AnalysisSession::new(threads);
        let ctx = session.restore(self.tables)?;
        for program in self.programs {
            ctx.insert_program(program);
        }

        let mut operations = self.operations;
        operations.assign_layers(&namer);
        operations.set_layer_order(naming.layer_order);
        operations.populate_vars(false);

        let ctx = session.into_context().ok_or(AnalysisError::Reanalysis)?;
        Ok((ctx, operations))
    }
}
