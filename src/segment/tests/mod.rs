mod helpers;
mod tests_positions;
