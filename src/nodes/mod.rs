//! Leaf and interior nodes of an epilogue tree.

pub mod aux;
pub mod broadcast;
pub mod compute;
pub mod fetch;
pub mod reduction;
pub mod topk;
