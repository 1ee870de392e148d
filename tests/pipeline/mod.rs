mod runner;
mod watcher;
