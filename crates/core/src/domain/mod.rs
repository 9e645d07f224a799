pub mod bill;
pub mod customer;
pub mod event;
pub mod subscription;
