mod lifecycle;
mod scenarios;
