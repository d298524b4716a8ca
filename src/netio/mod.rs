pub mod endpoint;
pub mod frame;
pub mod ifapply;
pub mod ndp;
pub mod pair;
pub mod relay;
pub mod rudp;
