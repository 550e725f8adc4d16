//! Pipeline tag to visitor tree resolution.
//!
//! `FusionCallbacks<Policy, Cta, Epi>` is implemented by every catalog tag for the policies it
//! supports. A tag/policy pair without an impl has no fused epilogue and fails to compile.

use tracing::debug;

use crate::core::element::NumericKind;
use crate::semantic::visitor::Visitor;

pub trait FusionCallbacks<Policy, Cta, Epi> {
    /// The composed visitor tree.
    type Impl: Visitor;
    /// Flat, user-facing arguments.
    type Arguments: Clone + Default + Send + Sync;

    /// Element kind of the auxiliary tensor, for pipelines that load or store one.
    const AUX_KIND: Option<NumericKind> = None;

    /// Translates flat arguments into the tree's nested argument structure.
    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments;
}

/// Lowers `args` and constructs the visitor tree selected by `Tag` under `Policy`.
pub fn make_callbacks<Policy, Tag, Cta, Epi>(args: &Tag::Arguments) -> Tag::Impl
where
    Tag: FusionCallbacks<Policy, Cta, Epi>,
{
    debug!(
        pipeline = std::any::type_name::<Tag>(),
        aux = ?Tag::AUX_KIND.map(NumericKind::name),
        "lowering fusion callbacks"
    );
    Tag::Impl::new(Tag::lower(args))
}

/// Nested arguments the tree selected by `Tag` expects.
pub type NestedArguments<Policy, Tag, Cta, Epi> =
    <<Tag as FusionCallbacks<Policy, Cta, Epi>>::Impl as Visitor>::Arguments;
