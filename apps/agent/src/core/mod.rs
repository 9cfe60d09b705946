pub mod cmd;
pub mod net;
pub mod ovs;
