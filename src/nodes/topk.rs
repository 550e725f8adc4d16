use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::core::element::{ComputeElement, Element, Rounding};
use crate::core::error::EpilogueError;
use crate::core::shape::{ProblemShape, Subtile, TileContext, TileShape};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::NodeOp;

/// Row-wise top-`K` followed by softmax over the selected entries.
///
/// For every row the `K` largest values are kept (ties go to the lower column index, NaN ranks
/// below everything), a max-subtracted softmax is taken over them, and every other element of
/// the row becomes zero. A NaN that makes it into the top `K` gets probability zero, and a
/// row of NaN only is all zeros. The whole row must lie in one epilogue subtile of shape `Epi`.
pub struct TopKSoftmaxCol<const K: usize, Epi, Out, Cmp, R> {
    _marker: PhantomData<(Epi, Out, Cmp, R)>,
}

fn rank<C: ComputeElement>(a: C, b: C) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Unnormalized weight of `value` against the row maximum. Entries equal to the maximum
/// weigh 1 even when it is infinite, and NaN entries weigh 0.
fn softmax_weight<C: ComputeElement>(value: C, max: C) -> C {
    if value.is_nan() {
        C::zero()
    } else if value == max {
        C::one()
    } else {
        (value - max).exp()
    }
}

/// Column indices of the `k` largest entries of `row`, best first.
pub fn top_k_indices<C: ComputeElement>(row: &[C], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    // stable sort keeps lower indices first among equal values
    order.sort_by(|&i, &j| rank(row[j], row[i]));
    order.truncate(k);
    order
}

impl<const K: usize, Epi, Out, Cmp, R> NodeOp<1> for TopKSoftmaxCol<K, Epi, Out, Cmp, R>
where
    Epi: TileShape,
    Out: Element,
    Cmp: ComputeElement,
    R: Rounding,
{
    type Arguments = ();
    type Input = Cmp;
    type Output = Out;
    type TileState = ();

    fn new(_args: ()) -> Self {
        Self { _marker: PhantomData }
    }

    fn can_implement(_args: &(), problem: &ProblemShape) -> Result<(), EpilogueError> {
        if K > problem.n {
            return Err(EpilogueError::TopKExceedsRow { k: K, n: problem.n });
        }
        if problem.n > Epi::N {
            return Err(EpilogueError::RowExceedsSubtile { n: problem.n, width: Epi::N });
        }
        Ok(())
    }

    fn begin_tile(&self, tile: &TileContext) {
        debug_assert!(tile.problem.n <= tile.epi[1], "top-k row spans several subtiles");
    }

    fn apply(&self, _state: &mut (), _tile: &TileContext, sub: &Subtile, [input]: [Fragment<Cmp>; 1]) -> Fragment<Out> {
        let width = sub.valid_cols();
        let mut out = Fragment::filled(sub.rows, sub.cols, Out::default());
        for r in 0..sub.valid_rows() {
            let row = &input.row(r)[..width];
            let selected = top_k_indices(row, K);
            let Some(&best) = selected.first() else {
                continue;
            };
            let max = row[best];
            let exps: Vec<Cmp> = selected.iter().map(|&c| softmax_weight(row[c], max)).collect();
            let sum = exps.iter().fold(Cmp::zero(), |acc, &e| acc + e);
            if sum == Cmp::zero() {
                continue;
            }
            for (&c, &e) in selected.iter().zip(&exps) {
                out.set(r, c, (e / sum).convert::<Out>(R::STYLE));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::element::RoundNearest;
    use crate::core::shape::{Shape, TileCoord};

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let row = [1.0f32, 3.0, 3.0, 2.0, 3.0];
        assert_eq!(top_k_indices(&row, 2), vec![1, 2]);
        assert_eq!(top_k_indices(&row, 4), vec![1, 2, 4, 3]);
    }

    fn apply_row(row: &[f32]) -> Vec<f32> {
        let problem = ProblemShape::new(1, row.len(), 1, 1);
        let tile = TileContext { problem, coord: TileCoord { m: 0, n: 0, l: 0 }, cta: [1, 8], epi: [1, 8] };
        let sub = tile.subtile(0);
        let node = <TopKSoftmaxCol<2, Shape<1, 8, 1>, f32, f32, RoundNearest> as NodeOp<1>>::new(());
        let input = Fragment::from_fn(sub.rows, sub.cols, |_, c| row.get(c).copied().unwrap_or(0.0));
        let out = node.apply(&mut (), &tile, &sub, [input]);
        (0..row.len()).map(|c| out.get(0, c)).collect()
    }

    #[test]
    fn test_selected_nan_gets_zero_probability() {
        let nan = f32::NAN;
        assert_eq!(apply_row(&[5.0, nan, nan, nan, nan, nan, nan, nan]), vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(apply_row(&[nan; 8]), vec![0.0; 8]);
    }

    #[test]
    fn test_infinite_rows_stay_finite() {
        let ninf = f32::NEG_INFINITY;
        assert_eq!(apply_row(&[ninf; 8]), vec![0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let row = [1.0, f32::INFINITY, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(apply_row(&row), vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_nan_ranks_last() {
        let row = [f32::NAN, 0.5, -1.0];
        assert_eq!(top_k_indices(&row, 2), vec![1, 2]);
    }
}
