#![forbid(unsafe_code)]

use zdt_error::Result;
use zdt_ondisk::{BlockPointer, Dnode, ZilHeader};
use zdt_types::{Bookmark, Txg};

/// Which pass produced a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitPhase {
    /// Before the block's children.
    Pre,
    /// After the block's children.
    Post,
    /// An intent-log block or a block referenced by a logged write.
    Log,
}

/// What the visitor wants done with the block it was just shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VisitAction {
    #[default]
    Descend,
    /// Skip this block's children. Not an error.
    Prune,
}

/// One callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct Visit<'a> {
    /// `None` for a hole.
    pub bp: Option<&'a BlockPointer>,
    pub bookmark: Bookmark,
    /// The dnode owning `bp`, or `None` for object-set roots and log blocks.
    pub dnode: Option<&'a Dnode>,
    /// Set only for intent-log visits.
    pub zil: Option<&'a ZilHeader>,
    pub phase: VisitPhase,
}

impl Visit<'_> {
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.bp.is_none()
    }

    #[must_use]
    pub fn birth(&self) -> Option<Txg> {
        self.bp.map(|bp| bp.birth)
    }
}

/// Receives every visited block.
///
/// An `Err` is a visitor failure and is handled under the walk's error
/// policy; [`VisitAction::Prune`] is not.
pub trait BlockVisitor {
    fn visit(&mut self, visit: &Visit<'_>) -> Result<VisitAction>;
}

impl<F> BlockVisitor for F
where
    F: FnMut(&Visit<'_>) -> Result<VisitAction>,
{
    fn visit(&mut self, visit: &Visit<'_>) -> Result<VisitAction> {
        self(visit)
    }
}
