use serde::{Deserialize, Serialize};

/// GEMM problem extents: output is `m x n`, reduced over `k`, batched over `l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub l: usize,
}

impl ProblemShape {
    pub fn new(m: usize, n: usize, k: usize, l: usize) -> Self {
        Self { m, n, k, l }
    }

    pub fn output_len(&self) -> usize {
        self.m * self.n * self.l
    }
}

/// Element strides of a rank-3 (m, n, l) view. A zero component broadcasts along that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Stride {
    pub m: i64,
    pub n: i64,
    pub l: i64,
}

impl Stride {
    pub const fn new(m: i64, n: i64, l: i64) -> Self {
        Self { m, n, l }
    }

    /// Same value everywhere.
    pub const fn broadcast() -> Self {
        Self::new(0, 0, 0)
    }

    /// One value per row, shared across columns.
    pub const fn per_row(batch: i64) -> Self {
        Self::new(1, 0, batch)
    }

    /// One value per column, shared across rows.
    pub const fn per_col(batch: i64) -> Self {
        Self::new(0, 1, batch)
    }

    pub const fn row_major(ld: i64, batch: i64) -> Self {
        Self::new(ld, 1, batch)
    }

    pub const fn col_major(ld: i64, batch: i64) -> Self {
        Self::new(1, ld, batch)
    }

    pub fn packed_row_major(problem: &ProblemShape) -> Self {
        Self::row_major(problem.n as i64, (problem.m * problem.n) as i64)
    }

    pub fn packed_col_major(problem: &ProblemShape) -> Self {
        Self::col_major(problem.m as i64, (problem.m * problem.n) as i64)
    }

    #[inline]
    pub fn offset(&self, m: usize, n: usize, l: usize) -> usize {
        (m as i64 * self.m + n as i64 * self.n + l as i64 * self.l) as usize
    }

    /// Number of elements a view of `problem` reaches through this stride.
    pub fn extent(&self, problem: &ProblemShape) -> usize {
        if problem.m == 0 || problem.n == 0 || problem.l == 0 {
            return 0;
        }
        self.offset(problem.m - 1, problem.n - 1, problem.l - 1) + 1
    }
}

/// Compile-time tile extents.
pub trait TileShape: Send + Sync + 'static {
    const M: usize;
    const N: usize;
    const K: usize;

    fn dims() -> [usize; 3] {
        [Self::M, Self::N, Self::K]
    }
}

pub struct Shape<const M: usize, const N: usize, const K: usize = 1>;

impl<const M: usize, const N: usize, const K: usize> TileShape for Shape<M, N, K> {
    const M: usize = M;
    const N: usize = N;
    const K: usize = K;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub m: usize,
    pub n: usize,
    pub l: usize,
}

/// Everything a node may know about the CTA tile being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct TileContext {
    pub problem: ProblemShape,
    pub coord: TileCoord,
    /// CTA tile (m, n).
    pub cta: [usize; 2],
    /// Epilogue subtile (m, n).
    pub epi: [usize; 2],
}

impl TileContext {
    pub fn row_origin(&self) -> usize {
        self.coord.m * self.cta[0]
    }

    pub fn col_origin(&self) -> usize {
        self.coord.n * self.cta[1]
    }

    pub fn subtiles_m(&self) -> usize {
        self.cta[0].div_ceil(self.epi[0])
    }

    pub fn subtiles_n(&self) -> usize {
        self.cta[1].div_ceil(self.epi[1])
    }

    pub fn subtile_count(&self) -> usize {
        self.subtiles_m() * self.subtiles_n()
    }

    /// Subtiles are visited row-major within the CTA tile.
    pub fn subtile(&self, index: usize) -> Subtile {
        let epi_m = index / self.subtiles_n();
        let epi_n = index % self.subtiles_n();
        Subtile {
            index,
            epi_m,
            epi_n,
            row0: self.row_origin() + epi_m * self.epi[0],
            col0: self.col_origin() + epi_n * self.epi[1],
            rows: self.epi[0],
            cols: self.epi[1],
            batch: self.coord.l,
            m: self.problem.m,
            n: self.problem.n,
        }
    }
}

/// One epilogue subtile: the unit a fragment covers.
#[derive(Debug, Clone, Copy)]
pub struct Subtile {
    pub index: usize,
    pub epi_m: usize,
    pub epi_n: usize,
    /// Global row of the fragment's first row.
    pub row0: usize,
    pub col0: usize,
    pub rows: usize,
    pub cols: usize,
    pub batch: usize,
    m: usize,
    n: usize,
}

impl Subtile {
    /// Residue predicate: false for fragment elements past the problem edge.
    #[inline]
    pub fn is_valid(&self, r: usize, c: usize) -> bool {
        self.row0 + r < self.m && self.col0 + c < self.n
    }

    pub fn valid_rows(&self) -> usize {
        self.m.saturating_sub(self.row0).min(self.rows)
    }

    pub fn valid_cols(&self) -> usize {
        self.n.saturating_sub(self.col0).min(self.cols)
    }
}
