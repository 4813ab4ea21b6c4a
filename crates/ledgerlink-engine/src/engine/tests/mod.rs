mod common;

mod coalescing;
mod grid_batching;
mod metadata;
mod preload;
