pub mod buffer_pool;
pub mod decoder;
pub mod display_state;
pub mod frame_source;
pub mod multipart;
pub mod notify_source;
pub mod raster;
pub mod reconnect;
pub mod renderer;
