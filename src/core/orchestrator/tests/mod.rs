mod background;
mod drain;
