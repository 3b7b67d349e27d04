mod connections;
mod end_to_end;
mod harness;
