mod background;
mod disk_cache;
mod memory_cache;
mod runner;
