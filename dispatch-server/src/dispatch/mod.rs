//! 派单模块
//!
//! - [`DispatchCoordinator`] - 派单、抢单、拒单、转人工和订单生命周期
//! - [`OfferBook`] - 内存中的派单轮次

pub mod coordinator;
pub mod offers;

pub use coordinator::{
    AcceptOutcome, Assignment, DispatchCoordinator, DispatchWindows, RejectOutcome, SubmitOutcome,
};
pub use offers::{Offer, OfferBook, OfferUpdate, Rejection};
