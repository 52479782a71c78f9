pub mod aggregator;
pub mod api;
pub mod leaderboard;
pub mod live;
pub mod login;
pub mod obs;
pub mod persistence;
pub mod refresh;
pub mod settings;
pub mod throttle;
