mod consumer_test;
mod file_stores_test;
mod medallion_test;
mod postgres_test;
