//! Tile-by-tile execution of a fused epilogue.
//!
//! The executor walks the CTA tiles of a problem in the configured [`TileOrder`], hands each
//! epilogue subtile's accumulators and source values to the visitor tree, and writes the
//! root fragment into D. Stores past the problem edge are dropped.

use std::marker::PhantomData;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::core::config::{EpilogueConfig, TileOrder};
use crate::core::element::Element;
use crate::core::error::EpilogueError;
use crate::core::memory::TensorRef;
use crate::core::shape::{ProblemShape, TileContext, TileCoord, TileShape};
use crate::policy::dispatch::{make_callbacks, FusionCallbacks};
use crate::runtime::mainloop::AccumulatorSource;
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{VisitInputs, Visitor};

/// Type-erased read access to the source tensor C.
pub trait SourceTensor: Send + Sync {
    fn load_f64(&self, m: usize, n: usize, l: usize) -> f64;

    fn check(&self, name: &'static str, problem: &ProblemShape) -> Result<(), EpilogueError>;
}

impl<E: Element> SourceTensor for TensorRef<E> {
    #[inline]
    fn load_f64(&self, m: usize, n: usize, l: usize) -> f64 {
        self.load(m, n, l).into_f64()
    }

    fn check(&self, name: &'static str, problem: &ProblemShape) -> Result<(), EpilogueError> {
        self.buffer.check_extent(name, &self.stride, problem)
    }
}

pub struct Epilogue<Cta: TileShape, Epi: TileShape, V: Visitor> {
    callbacks: V,
    args: V::Arguments,
    config: EpilogueConfig,
    _tile: PhantomData<(Cta, Epi)>,
}

impl<Cta: TileShape, Epi: TileShape, V: Visitor> Epilogue<Cta, Epi, V> {
    pub fn new(args: V::Arguments, config: EpilogueConfig) -> Self {
        Self::from_parts(V::new(args.clone()), args, config)
    }

    pub fn from_parts(callbacks: V, args: V::Arguments, config: EpilogueConfig) -> Self {
        Self { callbacks, args, config, _tile: PhantomData }
    }

    pub fn callbacks(&self) -> &V {
        &self.callbacks
    }

    pub fn config(&self) -> &EpilogueConfig {
        &self.config
    }

    pub fn needs_source(&self) -> bool {
        self.callbacks.needs_source()
    }

    pub fn can_implement(&self, problem: &ProblemShape) -> Result<(), EpilogueError> {
        if Epi::M == 0 || Epi::N == 0 || Cta::M % Epi::M != 0 || Cta::N % Epi::N != 0 {
            return Err(EpilogueError::InvalidConfig(format!(
                "epilogue tile {}x{} does not divide CTA tile {}x{}",
                Epi::M,
                Epi::N,
                Cta::M,
                Cta::N
            )));
        }
        V::can_implement(&self.args, problem)
    }

    /// CTA tile coordinates in issue order.
    pub fn tile_coords(&self, problem: &ProblemShape) -> Vec<TileCoord> {
        let tiles_m = problem.m.div_ceil(Cta::M);
        let tiles_n = problem.n.div_ceil(Cta::N);
        let mut coords = Vec::with_capacity(tiles_m * tiles_n * problem.l);
        for l in 0..problem.l {
            match self.config.tile_order {
                TileOrder::ColumnMajor => {
                    for n in 0..tiles_n {
                        coords.extend((0..tiles_m).map(|m| TileCoord { m, n, l }));
                    }
                }
                TileOrder::RowMajor | TileOrder::Reversed => {
                    for m in 0..tiles_m {
                        coords.extend((0..tiles_n).map(|n| TileCoord { m, n, l }));
                    }
                }
            }
        }
        if self.config.tile_order == TileOrder::Reversed {
            coords.reverse();
        }
        coords
    }

    /// Runs the epilogue over every tile of the mainloop's problem and writes D.
    ///
    /// `source` is ignored when no node reads C; a tree that reads C without one sees zeros.
    pub fn run<A>(
        &self,
        mainloop: &A,
        source: Option<&dyn SourceTensor>,
        output: &TensorRef<V::Output>,
    ) -> Result<(), EpilogueError>
    where
        A: AccumulatorSource + ?Sized,
    {
        let problem = mainloop.problem();
        self.can_implement(&problem)?;
        output.buffer.check_extent("D", &output.stride, &problem)?;
        let source = if self.needs_source() { source } else { None };
        if let Some(src) = source {
            src.check("C", &problem)?;
        }

        let coords = self.tile_coords(&problem);
        debug!(
            m = problem.m,
            n = problem.n,
            l = problem.l,
            tiles = coords.len(),
            parallel = self.config.parallel,
            order = ?self.config.tile_order,
            "running epilogue"
        );

        if self.config.parallel {
            coords.par_iter().for_each(|&coord| self.run_tile(mainloop, source, output, problem, coord));
        } else {
            coords.iter().for_each(|&coord| self.run_tile(mainloop, source, output, problem, coord));
        }
        Ok(())
    }

    fn run_tile<A>(
        &self,
        mainloop: &A,
        source: Option<&dyn SourceTensor>,
        output: &TensorRef<V::Output>,
        problem: ProblemShape,
        coord: TileCoord,
    ) where
        A: AccumulatorSource + ?Sized,
    {
        let tile = TileContext { problem, coord, cta: [Cta::M, Cta::N], epi: [Epi::M, Epi::N] };
        trace!(m = coord.m, n = coord.n, l = coord.l, "epilogue tile");

        let acc_tile = mainloop.tile_accumulators(&tile);
        let mut state = self.callbacks.begin_tile(&tile);
        for index in 0..tile.subtile_count() {
            let sub = tile.subtile(index);
            let (r0, c0) = (sub.epi_m * Epi::M, sub.epi_n * Epi::N);
            let acc = Fragment::from_fn(sub.rows, sub.cols, |r, c| acc_tile.get(r0 + r, c0 + c));
            let src = Fragment::from_fn(sub.rows, sub.cols, |r, c| match source {
                Some(s) if sub.is_valid(r, c) => s.load_f64(sub.row0 + r, sub.col0 + c, sub.batch),
                _ => 0.0,
            });

            let out = self.callbacks.visit(&mut state, &tile, &sub, &VisitInputs::new(&acc, &src));
            for r in 0..sub.valid_rows() {
                for c in 0..sub.valid_cols() {
                    output.store(sub.row0 + r, sub.col0 + c, sub.batch, out.get(r, c));
                }
            }
        }
        self.callbacks.end_tile(state, &tile);
    }
}

/// Builds the executor for the pipeline `Tag` under `Policy` from flat arguments.
pub fn make_epilogue<Policy, Tag, Cta, Epi>(
    args: &Tag::Arguments,
    config: EpilogueConfig,
) -> Epilogue<Cta, Epi, Tag::Impl>
where
    Tag: FusionCallbacks<Policy, Cta, Epi>,
    Cta: TileShape,
    Epi: TileShape,
{
    let callbacks = make_callbacks::<Policy, Tag, Cta, Epi>(args);
    Epilogue::from_parts(callbacks, Tag::lower(args), config)
}
