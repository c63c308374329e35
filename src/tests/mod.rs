mod registry;
mod web;
