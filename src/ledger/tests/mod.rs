mod tests_sst;
